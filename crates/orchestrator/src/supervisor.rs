//! Session supervision.
//!
//! Owns a live session from handoff to `Closed`. Races four things while the
//! task-runner holds the handle: task completion, the wall-clock deadline,
//! liveness probing, and external cancellation. Whatever wins, the session
//! takes exactly one terminal transition and `Closing -> Closed` runs on
//! every path - the browser process does not outlive its session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactKind, ArtifactRecorder, ArtifactRef, LogEntry};
use crate::cascade::AttemptRecord;
use crate::error::FailureKind;
use crate::events::SessionEvent;
use crate::session::{Session, SessionState};

/// The task-runner collaborator. Receives the live handle; must signal
/// completion or failure back by returning, and must not retain the handle
/// past `Closing` (operations fail with `InvalidState` if it does).
#[async_trait]
pub trait SessionTask: Send + Sync {
    async fn run(
        &self,
        session: Arc<Session>,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Single wall-clock deadline covering the whole `InUse` period.
    pub deadline: Duration,
    pub probe_interval: Duration,
    /// How long an unanswered probe may hang before it counts as a failure.
    pub probe_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            probe_interval: Duration::from_secs(5),
            probe_grace: Duration::from_secs(10),
        }
    }
}

/// What supervision produced: the task's value or a classified failure,
/// plus whatever artifacts were captured along the way.
pub struct SupervisedRun {
    pub result: Result<Value, (FailureKind, String)>,
    pub artifacts: Vec<ArtifactRef>,
}

pub struct SessionSupervisor {
    session: Arc<Session>,
    recorder: Arc<ArtifactRecorder>,
    config: SupervisorConfig,
    /// Cascade history for this task, folded into the Log artifact.
    attempts: Vec<AttemptRecord>,
}

impl SessionSupervisor {
    pub fn new(
        session: Session,
        recorder: Arc<ArtifactRecorder>,
        config: SupervisorConfig,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            session: Arc::new(session),
            recorder,
            config,
            attempts,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Hand the session to the task and supervise until a terminal state.
    pub async fn run(&self, task: &dyn SessionTask, cancel: &CancellationToken) -> SupervisedRun {
        self.session.set_state(SessionState::InUse);
        self.session.events().publish(SessionEvent::TaskStarted);

        let verdict: Result<Value, (FailureKind, String)> = tokio::select! {
            result = task.run(self.session.clone()) => match result {
                Ok(value) => Ok(value),
                Err(err) => Err((FailureKind::Task, err.to_string())),
            },
            _ = tokio::time::sleep(self.config.deadline) => {
                self.session.events().publish(SessionEvent::DeadlineExceeded);
                Err((
                    FailureKind::Timeout,
                    format!("task exceeded the {:?} session deadline", self.config.deadline),
                ))
            }
            detail = self.watch_health() => {
                Err((FailureKind::HealthCheck, detail))
            }
            _ = cancel.cancelled() => {
                self.session.events().publish(SessionEvent::Cancelled);
                Err((FailureKind::Cancelled, "task cancelled by caller".to_string()))
            }
        };

        match verdict {
            Ok(value) => {
                let artifacts = if self.recorder.capture_on_success() {
                    self.capture_audit_trail().await
                } else {
                    Vec::new()
                };
                self.close().await;
                SupervisedRun {
                    result: Ok(value),
                    artifacts,
                }
            }
            Err((kind, detail)) => {
                tracing::warn!(session = %self.session.id(), %kind, %detail, "session failed");
                self.session.set_state(SessionState::Failed);
                self.session
                    .events()
                    .publish(SessionEvent::Failed { kind });
                let artifacts = self.capture_failure(kind, &detail).await;
                self.close().await;
                SupervisedRun {
                    result: Err((kind, detail)),
                    artifacts,
                }
            }
        }
    }

    /// Resolves only when the session stops looking alive: a probe hangs
    /// past the grace period, the channel closes, or the browser reports a
    /// crashed target. Sessions without a control channel are unobservable,
    /// so this never resolves for them - the deadline still applies.
    async fn watch_health(&self) -> String {
        let Some(control) = self.session.control() else {
            std::future::pending::<()>().await;
            unreachable!();
        };

        let mut events = control.subscribe();
        let mut ticks = tokio::time::interval(self.config.probe_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticks.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Err(err) = control.probe(self.config.probe_grace).await {
                        let detail = format!("liveness probe unanswered: {err}");
                        self.session.events().publish(SessionEvent::ProbeMissed {
                            detail: detail.clone(),
                        });
                        return detail;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.method == "Inspector.targetCrashed" => {
                        self.session.events().publish(SessionEvent::TargetCrashed);
                        return "browser target crashed".to_string();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        let detail = "control channel closed".to_string();
                        self.session.events().publish(SessionEvent::ProbeMissed {
                            detail: detail.clone(),
                        });
                        return detail;
                    }
                }
            }
        }
    }

    /// Screenshot (when the channel still answers), Log, Transcript.
    /// Best-effort throughout; capture failures never block cleanup.
    async fn capture_failure(&self, kind: FailureKind, detail: &str) -> Vec<ArtifactRef> {
        let mut artifacts = Vec::new();
        let session = &self.session;

        let channel_alive = session
            .control()
            .map(|c| !c.is_closed())
            .unwrap_or(false);

        let mut page_html = None;
        if channel_alive {
            if let Ok(png) = session.screenshot_raw().await {
                artifacts.extend(
                    self.recorder
                        .capture(session.id(), ArtifactKind::Screenshot, &png)
                        .await,
                );
            }
            page_html = session.page_html_raw().await.ok();
        }

        let entry = LogEntry {
            session: session.id(),
            at: Utc::now(),
            failure: Some(kind),
            detail: Some(detail.to_string()),
            attempts: self.attempts.clone(),
            events: session.events().history(),
            page_html,
        };
        artifacts.extend(self.recorder.capture_log(&entry).await);
        artifacts.extend(
            self.recorder
                .capture_transcript(session.id(), &session.transcript().snapshot())
                .await,
        );
        artifacts
    }

    /// Success-path audit trail (policy-gated): Log + Transcript.
    async fn capture_audit_trail(&self) -> Vec<ArtifactRef> {
        let session = &self.session;
        let mut artifacts = Vec::new();
        let entry = LogEntry {
            session: session.id(),
            at: Utc::now(),
            failure: None,
            detail: None,
            attempts: self.attempts.clone(),
            events: session.events().history(),
            page_html: None,
        };
        artifacts.extend(self.recorder.capture_log(&entry).await);
        artifacts.extend(
            self.recorder
                .capture_transcript(session.id(), &session.transcript().snapshot())
                .await,
        );
        artifacts
    }

    /// `Closing -> Closed`, exactly once, on every path.
    async fn close(&self) {
        if !self.session.begin_close() {
            return;
        }
        self.session.events().publish(SessionEvent::Closing);
        self.session.release_process().await;
        if let Some(control) = self.session.control() {
            control.close().await;
        }
        self.session.set_state(SessionState::Closed);
        self.session.events().publish(SessionEvent::Closed);
        tracing::info!(session = %self.session.id(), "session closed");
    }
}
