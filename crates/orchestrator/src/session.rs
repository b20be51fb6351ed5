//! Live browser session handle.
//!
//! Created by the factory in `Launching`, handed to the task-runner only in
//! `Ready`/`InUse`, owned by the supervisor until `Closed`. The underlying
//! driver/browser process is the resource the supervisor must release on
//! every exit path.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::control::ControlClient;
use crate::error::SessionError;
use crate::events::EventBus;
use crate::transcript::{Step, Transcript};
use crate::version::BrowserTarget;

/// Opaque session/task identifier; also keys every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Launching,
    Ready,
    InUse,
    Failed,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Launching => "launching",
            SessionState::Ready => "ready",
            SessionState::InUse => "in_use",
            SessionState::Failed => "failed",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

const DEFAULT_NAV_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Session {
    id: SessionId,
    target: BrowserTarget,
    child: Mutex<Option<Child>>,
    control: Option<Arc<ControlClient>>,
    state: RwLock<SessionState>,
    transcript: Transcript,
    events: EventBus,
    scratch_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &*self.state.read().unwrap())
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        target: BrowserTarget,
        child: Child,
        control: Arc<ControlClient>,
        scratch_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            target,
            child: Mutex::new(Some(child)),
            control: Some(control),
            state: RwLock::new(SessionState::Launching),
            transcript: Transcript::default(),
            events: EventBus::new(),
            scratch_dir,
        }
    }

    /// A session with no process or control channel behind it. State-machine
    /// and supervision tests use this; production code never does.
    #[cfg(test)]
    pub(crate) fn detached(id: SessionId, target: BrowserTarget) -> Self {
        Self {
            id,
            target,
            child: Mutex::new(None),
            control: None,
            state: RwLock::new(SessionState::Launching),
            transcript: Transcript::default(),
            events: EventBus::new(),
            scratch_dir: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &BrowserTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state.read().map(|s| *s).unwrap_or(SessionState::Failed)
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn control(&self) -> Option<&Arc<ControlClient>> {
        self.control.as_ref()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.write() {
            tracing::debug!(session = %self.id, from = %*state, to = %next, "state transition");
            *state = next;
        }
    }

    /// First claim on the terminal path wins; everyone else gets `false`.
    /// This is what makes `Closing -> Closed` run exactly once.
    pub(crate) fn begin_close(&self) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        tracing::debug!(session = %self.id, from = %*state, "state transition to closing");
        *state = SessionState::Closing;
        true
    }

    fn usable(&self, op: &'static str) -> Result<(), SessionError> {
        let state = self.state();
        if matches!(state, SessionState::Ready | SessionState::InUse) {
            Ok(())
        } else {
            Err(SessionError::InvalidState { state, op })
        }
    }

    fn channel(&self) -> Result<&Arc<ControlClient>, SessionError> {
        self.control.as_ref().ok_or(SessionError::Control(
            crate::control::ControlError::Closed,
        ))
    }

    /// Navigate the page. Recorded in the transcript.
    pub async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.usable("navigate")?;
        let result = self
            .channel()?
            .command(
                "Page.navigate",
                Some(json!({ "url": url })),
                DEFAULT_NAV_TIMEOUT,
            )
            .await?;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            if !reason.is_empty() {
                return Err(SessionError::Navigation {
                    url: url.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
        self.transcript.record(Step::Navigation {
            url: url.to_string(),
        });
        Ok(())
    }

    /// Evaluate a script and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
        self.usable("evaluate")?;
        self.evaluate_raw(expression).await
    }

    /// Evaluate and record the result as an extracted fragment.
    pub async fn extract(&self, label: &str, expression: &str) -> Result<Value, SessionError> {
        let value = self.evaluate(expression).await?;
        self.transcript.record(Step::Fragment {
            label: label.to_string(),
            content: value.clone(),
        });
        Ok(value)
    }

    /// Set a form field through the page's own event machinery, so the
    /// portal's listeners observe an ordinary input. Recorded.
    pub async fn fill(&self, selector: &str, value: &str) -> Result<(), SessionError> {
        self.usable("fill")?;
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({selector});
                if (!el) return false;
                el.focus();
                el.value = {value};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            selector = Value::String(selector.to_string()),
            value = Value::String(value.to_string()),
        );
        let found = self.evaluate_raw(&script).await?;
        if found != Value::Bool(true) {
            return Err(SessionError::Script {
                detail: format!("no element matched selector {selector}"),
            });
        }
        self.transcript.record(Step::Input {
            selector: selector.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    /// PNG screenshot of the current viewport.
    pub async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        self.usable("screenshot")?;
        self.screenshot_raw().await
    }

    /// Screenshot without the state gate; the supervisor uses this while the
    /// session is already `Failed` to capture the failure frame.
    pub(crate) async fn screenshot_raw(&self) -> Result<Vec<u8>, SessionError> {
        let result = self
            .channel()?
            .command(
                "Page.captureScreenshot",
                Some(json!({ "format": "png" })),
                DEFAULT_EVAL_TIMEOUT,
            )
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Decode("screenshot reply missing data".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| SessionError::Decode(format!("screenshot base64: {err}")))
    }

    /// Serialized page DOM, folded into the failure log for triage.
    pub(crate) async fn page_html_raw(&self) -> Result<String, SessionError> {
        let value = self
            .evaluate_raw("document.documentElement ? document.documentElement.outerHTML : ''")
            .await?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError::Decode("page HTML was not a string".into()))
    }

    async fn evaluate_raw(&self, expression: &str) -> Result<Value, SessionError> {
        let result = self
            .channel()?
            .command(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
                DEFAULT_EVAL_TIMEOUT,
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(SessionError::Script {
                detail: details
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("uncaught exception")
                    .to_string(),
            });
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Kill the driver/browser process and drop the scratch profile.
    /// Idempotent; errors are logged, never propagated - cleanup must not
    /// be able to fail the close path.
    pub(crate) async fn release_process(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Err(err) = child.kill().await {
                tracing::debug!(session = %self.id, %err, "kill on already-dead child");
            }
            match child.wait().await {
                Ok(status) => {
                    tracing::debug!(session = %self.id, %status, "browser process reaped")
                }
                Err(err) => tracing::warn!(session = %self.id, %err, "browser process wait"),
            }
        }
        *guard = None;
        if let Some(dir) = &self.scratch_dir {
            if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(session = %self.id, %err, "scratch profile cleanup");
                }
            }
        }
    }
}
