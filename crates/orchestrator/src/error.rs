//! Failure taxonomy for the orchestration core.
//!
//! Every failure that crosses the crate boundary is classified here.
//! Raw process/IO/protocol errors never escape unwrapped - the caller
//! always sees a machine-readable kind plus the artifacts that explain it.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::cascade::AttemptRecord;
use crate::control::ControlError;
use crate::session::SessionState;
use crate::version::BrowserVersion;

/// No usable {binary, driver} pair. Fatal to the process - the deployment
/// layer has to fix the installation; nothing at runtime can.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no browser binary found ({searched} locations searched)")]
    NoBinaryFound { searched: usize },

    #[error("no compatible driver installed for browser {binary_version}")]
    NoCompatibleDriver { binary_version: BrowserVersion },
}

/// A single launch attempt failed.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn driver process: {0}")]
    ProcessSpawnFailed(#[source] std::io::Error),

    #[error("control channel handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("browser crashed during startup: {detail}")]
    CrashOnStartup { detail: String },
}

impl LaunchError {
    /// Transient failures are worth retrying on the same target;
    /// deterministic ones will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, LaunchError::HandshakeTimeout(_))
    }
}

/// Every candidate and every retry is spent. Carries the full attempt
/// history so the caller (and the Log artifact) can see what was tried.
#[derive(Debug, Error)]
#[error("launch cascade exhausted after {} attempts", .attempts.len())]
pub struct CascadeExhausted {
    pub attempts: Vec<AttemptRecord>,
}

/// Errors surfaced by operations on a live [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("session is {state}, cannot {op}")]
    InvalidState {
        state: SessionState,
        op: &'static str,
    },

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("script evaluation failed: {detail}")]
    Script { detail: String },

    #[error("malformed control-channel payload: {0}")]
    Decode(String),
}

/// Machine-readable classification returned to the caller on every
/// failure path, alongside attempt history and artifact references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No compatible runtime pair (bootstrap only).
    Resolution,
    /// The launch cascade ran dry.
    LaunchExhausted,
    /// The wall-clock deadline over the task expired.
    Timeout,
    /// The session stopped answering liveness probes (or crashed) mid-use.
    HealthCheck,
    /// The task-runner itself reported failure.
    Task,
    /// The task was cancelled from outside.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Resolution => "resolution",
            FailureKind::LaunchExhausted => "launch_exhausted",
            FailureKind::Timeout => "timeout",
            FailureKind::HealthCheck => "health_check",
            FailureKind::Task => "task",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LaunchError::HandshakeTimeout(Duration::from_secs(30)).is_transient());
        assert!(!LaunchError::CrashOnStartup {
            detail: "exit code 127".into()
        }
        .is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(!LaunchError::ProcessSpawnFailed(io).is_transient());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::LaunchExhausted).unwrap();
        assert_eq!(json, "\"launch_exhausted\"");
    }
}
