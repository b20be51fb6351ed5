//! Diagnostic artifact capture.
//!
//! Failures happen on a remote, uninspectable portal; the screenshot, the
//! structured log and the conversation transcript are all the triage
//! material there will ever be. Capture is best-effort: a failed write is
//! logged and swallowed here, and only here - diagnostics must never take
//! the scraping task down with them.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cascade::AttemptRecord;
use crate::error::FailureKind;
use crate::events::RecordedEvent;
use crate::session::SessionId;
use crate::transcript::TranscriptStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Log,
    Transcript,
}

impl ArtifactKind {
    /// Fixed flat directory per kind, created at startup.
    pub fn dir(self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "debug_screenshots",
            ArtifactKind::Log => "debug_logs",
            ArtifactKind::Transcript => "conversations",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::Log | ArtifactKind::Transcript => "json",
        }
    }

    /// Deterministic name so tooling can correlate all three kinds of one
    /// session without a lookup table.
    pub fn file_name(self, session: &SessionId) -> String {
        format!("{session}.{}", self.extension())
    }
}

/// Pointer to a captured artifact, returned to the caller with failures.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRef {
    pub session: SessionId,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

/// Structured payload of the Log artifact.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    pub session: SessionId,
    pub at: DateTime<Utc>,
    pub failure: Option<FailureKind>,
    pub detail: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub events: Vec<RecordedEvent>,
    /// Page DOM at failure time, when the control channel still answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_html: Option<String>,
}

pub struct ArtifactRecorder {
    root: PathBuf,
    capture_on_success: bool,
}

impl ArtifactRecorder {
    pub fn new(root: impl Into<PathBuf>, capture_on_success: bool) -> Self {
        Self {
            root: root.into(),
            capture_on_success,
        }
    }

    /// Whether successful sessions also leave a transcript/log audit trail.
    pub fn capture_on_success(&self) -> bool {
        self.capture_on_success
    }

    /// Create the fixed directory layout. The one artifact operation that is
    /// allowed to fail hard: without the directories nothing later can work.
    pub async fn init(&self) -> std::io::Result<()> {
        for kind in [
            ArtifactKind::Screenshot,
            ArtifactKind::Log,
            ArtifactKind::Transcript,
        ] {
            tokio::fs::create_dir_all(self.root.join(kind.dir())).await?;
        }
        Ok(())
    }

    fn path_for(&self, session: &SessionId, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir()).join(kind.file_name(session))
    }

    /// Write one artifact. Returns `None` on failure - logged, swallowed.
    pub async fn capture(
        &self,
        session: SessionId,
        kind: ArtifactKind,
        payload: &[u8],
    ) -> Option<ArtifactRef> {
        let path = self.path_for(&session, kind);
        match tokio::fs::write(&path, payload).await {
            Ok(()) => {
                tracing::debug!(%session, ?kind, path = %path.display(), "artifact captured");
                Some(ArtifactRef {
                    session,
                    kind,
                    path,
                })
            }
            Err(err) => {
                tracing::warn!(%session, ?kind, path = %path.display(), %err,
                    "artifact write failed; continuing");
                None
            }
        }
    }

    pub async fn capture_log(&self, entry: &LogEntry) -> Option<ArtifactRef> {
        let payload = match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(session = %entry.session, %err, "log entry serialization failed");
                return None;
            }
        };
        self.capture(entry.session, ArtifactKind::Log, &payload).await
    }

    pub async fn capture_transcript(
        &self,
        session: SessionId,
        steps: &[TranscriptStep],
    ) -> Option<ArtifactRef> {
        let payload = match serde_json::to_vec_pretty(steps) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%session, %err, "transcript serialization failed");
                return None;
            }
        };
        self.capture(session, ArtifactKind::Transcript, &payload)
            .await
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{Step, Transcript};

    fn entry(session: SessionId) -> LogEntry {
        LogEntry {
            session,
            at: Utc::now(),
            failure: Some(FailureKind::Timeout),
            detail: Some("deadline expired".into()),
            attempts: Vec::new(),
            events: Vec::new(),
            page_html: None,
        }
    }

    #[tokio::test]
    async fn init_creates_fixed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), false);
        recorder.init().await.unwrap();

        for sub in ["debug_screenshots", "debug_logs", "conversations"] {
            assert!(dir.path().join(sub).is_dir());
        }
    }

    #[tokio::test]
    async fn artifacts_are_correlatable_by_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), false);
        recorder.init().await.unwrap();

        let session = SessionId::new();
        let shot = recorder
            .capture(session, ArtifactKind::Screenshot, b"\x89PNG")
            .await
            .unwrap();
        let log = recorder.capture_log(&entry(session)).await.unwrap();

        let transcript = Transcript::default();
        transcript.record(Step::Navigation {
            url: "https://portal.example".into(),
        });
        let convo = recorder
            .capture_transcript(session, &transcript.snapshot())
            .await
            .unwrap();

        assert_eq!(shot.path, dir.path().join(format!("debug_screenshots/{session}.png")));
        assert_eq!(log.path, dir.path().join(format!("debug_logs/{session}.json")));
        assert_eq!(convo.path, dir.path().join(format!("conversations/{session}.json")));
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        // Point the recorder somewhere unwritable: the layout was never
        // created, so the kind directory doesn't exist.
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path().join("missing"), false);

        let result = recorder
            .capture(SessionId::new(), ArtifactKind::Log, b"{}")
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn log_entry_round_trips_failure_kind() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), false);
        recorder.init().await.unwrap();

        let session = SessionId::new();
        let log = recorder.capture_log(&entry(session)).await.unwrap();
        let raw = tokio::fs::read_to_string(&log.path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["failure"], "timeout");
        assert_eq!(parsed["detail"], "deadline expired");
    }
}
