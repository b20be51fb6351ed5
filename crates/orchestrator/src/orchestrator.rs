//! Top-level composition.
//!
//! resolve -> launch (with cascade) -> hand off to the task-runner ->
//! supervise -> record outcome -> release. Resolution happens once at
//! bootstrap and is fatal if it fails; everything after that is per-task
//! and always comes back classified.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactRecorder, ArtifactRef, LogEntry};
use crate::cascade::{AttemptRecord, RetryCascade};
use crate::config::OrchestratorConfig;
use crate::error::{FailureKind, ResolutionError};
use crate::factory::StealthSessionFactory;
use crate::profile::SessionProfile;
use crate::session::SessionId;
use crate::supervisor::{SessionSupervisor, SessionTask};
use crate::version::{self, BrowserTarget, CompatibilityTable, VersionResolver};

/// What the caller gets back for every task - never a raw error.
#[derive(Debug)]
pub enum TaskOutcome {
    Success {
        session: SessionId,
        value: serde_json::Value,
        artifacts: Vec<ArtifactRef>,
    },
    Failure {
        session: SessionId,
        kind: FailureKind,
        attempts: Vec<AttemptRecord>,
        artifacts: Vec<ArtifactRef>,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("artifact directory setup failed: {0}")]
    Artifacts(#[from] std::io::Error),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    target: BrowserTarget,
    candidates: Vec<BrowserTarget>,
    factory: StealthSessionFactory,
    cascade: RetryCascade,
    recorder: Arc<ArtifactRecorder>,
    limiter: Arc<Semaphore>,
    active: DashMap<SessionId, CancellationToken>,
}

impl Orchestrator {
    /// Discover installed software, resolve the runtime pair, create the
    /// artifact layout. A resolution failure here is terminal by design.
    pub async fn bootstrap(config: OrchestratorConfig) -> Result<Self, BootstrapError> {
        let inventory = version::discover(&config).await;
        let resolver = VersionResolver::new(
            CompatibilityTable::new(config.compat_pairs.clone()),
            config.allow_latest_fallback,
        );
        let target = resolver.resolve(&inventory)?;
        let candidates = resolver.candidates(&inventory, config.preferred_driver_major);
        tracing::info!(
            binary = %target.binary_version,
            driver = %target.driver_version,
            fallbacks = candidates.len(),
            "runtime pair resolved"
        );

        let recorder = Arc::new(ArtifactRecorder::new(
            &config.artifact_root,
            config.capture_on_success,
        ));
        recorder.init().await?;

        let factory = StealthSessionFactory::new(config.port_base);
        let cascade = RetryCascade::new(config.retry_policy());
        let limiter = Arc::new(Semaphore::new(config.max_sessions));

        Ok(Self {
            config,
            target,
            candidates,
            factory,
            cascade,
            recorder,
            limiter,
            active: DashMap::new(),
        })
    }

    /// The pair resolved at bootstrap; immutable for the process lifetime.
    pub fn target(&self) -> &BrowserTarget {
        &self.target
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    /// Cancel a running task. Takes effect at health-check granularity.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.active.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight and refuse new admissions.
    pub fn shutdown(&self) {
        self.limiter.close();
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    /// Run one scraping task in its own supervised session. Blocks while
    /// the concurrency ceiling is reached.
    pub async fn run_task(&self, profile: &SessionProfile, task: &dyn SessionTask) -> TaskOutcome {
        let id = SessionId::new();

        let Ok(_permit) = self.limiter.acquire().await else {
            // Only happens after shutdown().
            return TaskOutcome::Failure {
                session: id,
                kind: FailureKind::Cancelled,
                attempts: Vec::new(),
                artifacts: Vec::new(),
            };
        };

        let token = CancellationToken::new();
        self.active.insert(id, token.clone());
        let outcome = self.execute(id, profile, task, &token).await;
        self.active.remove(&id);
        outcome
    }

    async fn execute(
        &self,
        id: SessionId,
        profile: &SessionProfile,
        task: &dyn SessionTask,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        // Headless can only be forced on, never off: the production
        // container has no display to attach to.
        let mut profile = profile.clone();
        profile.headless = profile.headless || self.config.headless;

        let factory = &self.factory;
        let launch_timeout = self.config.launch_timeout;
        let launched = self
            .cascade
            .run_with_fallback(&self.candidates, |target| {
                let profile = profile.clone();
                async move { factory.launch(id, &target, &profile, launch_timeout).await }
            })
            .await;

        match launched {
            Err(exhausted) => {
                let entry = LogEntry {
                    session: id,
                    at: chrono::Utc::now(),
                    failure: Some(FailureKind::LaunchExhausted),
                    detail: Some(exhausted.to_string()),
                    attempts: exhausted.attempts.clone(),
                    events: Vec::new(),
                    page_html: None,
                };
                let artifacts = self.recorder.capture_log(&entry).await.into_iter().collect();
                TaskOutcome::Failure {
                    session: id,
                    kind: FailureKind::LaunchExhausted,
                    attempts: exhausted.attempts,
                    artifacts,
                }
            }
            Ok((session, attempts)) => {
                let supervisor = SessionSupervisor::new(
                    session,
                    self.recorder.clone(),
                    self.config.supervisor_config(),
                    attempts.clone(),
                );
                let run = supervisor.run(task, cancel).await;
                match run.result {
                    Ok(value) => TaskOutcome::Success {
                        session: id,
                        value,
                        artifacts: run.artifacts,
                    },
                    Err((kind, _detail)) => TaskOutcome::Failure {
                        session: id,
                        kind,
                        attempts,
                        artifacts: run.artifacts,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct TitleTask;

    #[async_trait]
    impl SessionTask for TitleTask {
        async fn run(
            &self,
            session: Arc<Session>,
        ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
            session.navigate("https://example.com").await?;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            Ok(session.extract("title", "document.title").await?)
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_cleanly_without_browser() {
        let config = OrchestratorConfig {
            browser_paths: vec!["/nonexistent/chrome".into()],
            driver_paths: vec!["/nonexistent/chromedriver".into()],
            artifact_root: std::env::temp_dir().join("orchestrator-bootstrap-test"),
            ..OrchestratorConfig::default()
        };
        let err = Orchestrator::bootstrap(config)
            .await
            .err()
            .expect("bootstrap must fail without a browser");
        match err {
            BootstrapError::Resolution(ResolutionError::NoBinaryFound { searched }) => {
                assert_eq!(searched, 1);
            }
            other => panic!("expected NoBinaryFound, got {other:?}"),
        }
    }

    #[tokio::test]
    #[ignore] // Needs an installed Chrome + chromedriver pair
    async fn end_to_end_extracts_a_title() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            artifact_root: dir.path().to_path_buf(),
            allow_latest_fallback: true,
            ..OrchestratorConfig::from_env()
        };
        let orchestrator = Orchestrator::bootstrap(config).await.unwrap();

        let outcome = orchestrator
            .run_task(&SessionProfile::randomized(), &TitleTask)
            .await;

        assert!(outcome.is_success(), "outcome: {outcome:?}");
        assert_eq!(orchestrator.active_sessions(), 0);
    }
}
