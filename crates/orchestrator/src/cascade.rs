//! Ordered fallback with bounded retry.
//!
//! Candidates are tried in order. Transient failures get a per-candidate
//! retry budget with exponential backoff; deterministic failures move to the
//! next candidate immediately - retrying a crash that happens the same way
//! every time only burns the launch timeout again. Every try leaves an
//! [`AttemptRecord`], and exhaustion surfaces the whole history.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{CascadeExhausted, LaunchError};
use crate::version::BrowserTarget;

/// Outcome of one launch try.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    LaunchError { detail: String },
    Timeout { detail: String },
}

/// One entry per cascade try; appended, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub target: BrowserTarget,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    fn now(target: &BrowserTarget, outcome: AttemptOutcome) -> Self {
        Self {
            target: target.clone(),
            outcome,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries per candidate while failures stay transient.
    pub attempts_per_candidate: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts_per_candidate: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): initial * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct RetryCascade {
    policy: RetryPolicy,
}

impl RetryCascade {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Drive `attempt` through the candidates until one yields a value.
    /// Generic over the attempt output so the policy logic is testable
    /// without a browser behind it.
    pub async fn run_with_fallback<T, F, Fut>(
        &self,
        candidates: &[BrowserTarget],
        mut attempt: F,
    ) -> Result<(T, Vec<AttemptRecord>), CascadeExhausted>
    where
        F: FnMut(BrowserTarget) -> Fut,
        Fut: Future<Output = Result<T, LaunchError>>,
    {
        let mut attempts = Vec::new();
        let budget = self.policy.attempts_per_candidate.max(1);

        for candidate in candidates {
            for try_index in 0..budget {
                tracing::info!(
                    driver = %candidate.driver_version,
                    try_number = try_index + 1,
                    budget,
                    "launch attempt"
                );
                match attempt(candidate.clone()).await {
                    Ok(value) => {
                        attempts.push(AttemptRecord::now(candidate, AttemptOutcome::Success));
                        return Ok((value, attempts));
                    }
                    Err(err) if err.is_transient() => {
                        tracing::warn!(driver = %candidate.driver_version, %err,
                            "transient launch failure");
                        attempts.push(AttemptRecord::now(
                            candidate,
                            AttemptOutcome::Timeout {
                                detail: err.to_string(),
                            },
                        ));
                        if try_index + 1 < budget {
                            tokio::time::sleep(self.policy.backoff(try_index)).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(driver = %candidate.driver_version, %err,
                            "deterministic launch failure, moving to next candidate");
                        attempts.push(AttemptRecord::now(
                            candidate,
                            AttemptOutcome::LaunchError {
                                detail: err.to_string(),
                            },
                        ));
                        break;
                    }
                }
            }
        }

        Err(CascadeExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::version::BrowserVersion;

    fn target(driver_major: u32) -> BrowserTarget {
        BrowserTarget {
            binary_version: BrowserVersion::new(130, 0, 6723, 116),
            driver_version: BrowserVersion::new(driver_major, 0, 0, 0),
            binary_path: "/usr/bin/google-chrome".into(),
            driver_path: format!("/usr/local/bin/chromedriver-{driver_major}").into(),
        }
    }

    fn timeout_err() -> LaunchError {
        LaunchError::HandshakeTimeout(Duration::from_secs(30))
    }

    fn crash_err() -> LaunchError {
        LaunchError::CrashOnStartup {
            detail: "exit status 127".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_budget_exhausted_before_next_candidate() {
        // v114 and v113 time out through a 2-try budget, v112 launches.
        // The "default" candidate must never be touched: 2+2+1 = 5 records.
        let candidates = vec![target(114), target(113), target(112), target(1)];
        let cascade = RetryCascade::new(RetryPolicy::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (session, attempts) = cascade
            .run_with_fallback(&candidates, move |t| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if t.driver_version.major == 112 {
                        Ok("session")
                    } else {
                        Err(timeout_err())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(session, "session");
        assert_eq!(attempts.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Timeout { .. }));
        assert!(matches!(attempts[4].outcome, AttemptOutcome::Success));
        assert!(attempts
            .iter()
            .all(|a| a.target.driver_version.major != 1));
        // Ordering: candidate i's budget is spent before candidate i+1 starts.
        let majors: Vec<u32> = attempts.iter().map(|a| a.target.driver_version.major).collect();
        assert_eq!(majors, vec![114, 114, 113, 113, 112]);
    }

    #[tokio::test]
    async fn deterministic_failures_are_never_retried() {
        let candidates = vec![target(114), target(113)];
        let cascade = RetryCascade::new(RetryPolicy {
            attempts_per_candidate: 3,
            ..RetryPolicy::default()
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let err = cascade
            .run_with_fallback::<(), _, _>(&candidates, move |_| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async move { Err(crash_err()) }
            })
            .await
            .unwrap_err();

        // One try per candidate despite a budget of 3.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempts.len(), 2);
        assert!(err
            .attempts
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::LaunchError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_full_history() {
        let candidates = vec![target(114)];
        let cascade = RetryCascade::new(RetryPolicy::default());

        let err = cascade
            .run_with_fallback::<(), _, _>(&candidates, |_| async { Err(timeout_err()) })
            .await
            .unwrap_err();

        assert_eq!(err.attempts.len(), 2);
        assert!(err.to_string().contains("2 attempts"));
    }

    #[tokio::test]
    async fn empty_candidate_list_exhausts_immediately() {
        let cascade = RetryCascade::new(RetryPolicy::default());
        let err = cascade
            .run_with_fallback::<(), _, _>(&[], |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.attempts.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts_per_candidate: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
    }
}
