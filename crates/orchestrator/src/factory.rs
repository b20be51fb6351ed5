//! Evasion-hardened session launch.
//!
//! Spawns the anti-detection driver shim pointed at the pinned browser
//! binary, then performs the real readiness handshake: poll the DevTools
//! HTTP endpoint, pick up the page target's WebSocket, connect, and prove
//! the channel answers. A process that started but never answers is not a
//! session. Every failure path kills whatever was spawned - no orphans.

use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use url::Url;

use crate::control::{BrowserInfo, ControlClient, PageTarget};
use crate::error::LaunchError;
use crate::events::SessionEvent;
use crate::profile::SessionProfile;
use crate::session::{Session, SessionId, SessionState};
use crate::version::BrowserTarget;

const ENDPOINT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HANDSHAKE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StealthSessionFactory {
    http: reqwest::Client,
    port_base: u16,
    port_offset: AtomicU16,
}

impl StealthSessionFactory {
    pub fn new(port_base: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port_base,
            port_offset: AtomicU16::new(0),
        }
    }

    /// Each concurrent session gets its own DevTools port.
    fn next_port(&self) -> u16 {
        let offset = self.port_offset.fetch_add(1, Ordering::Relaxed) % 512;
        self.port_base.saturating_add(offset)
    }

    /// Launch a session for `target` with the given posture. Blocks up to
    /// `timeout` for the handshake; on any failure the spawned process is
    /// terminated and the scratch profile removed before returning.
    pub async fn launch(
        &self,
        id: SessionId,
        target: &BrowserTarget,
        profile: &SessionProfile,
        timeout: Duration,
    ) -> Result<Session, LaunchError> {
        let port = self.next_port();
        let scratch = std::env::temp_dir().join(format!(
            "portal-session-{}-{id}",
            std::process::id()
        ));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(LaunchError::ProcessSpawnFailed)?;

        let mut command = Command::new(&target.driver_path);
        command
            .arg(format!("--binary={}", target.binary_path.display()))
            .args(profile.chrome_args(&scratch, port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(
            session = %id,
            driver = %target.driver_path.display(),
            binary = %target.binary_version,
            port,
            "launching browser session"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                return Err(LaunchError::ProcessSpawnFailed(err));
            }
        };

        match self.handshake(&mut child, port, timeout).await {
            Ok(control) => {
                let session = Session::new(id, target.clone(), child, control, Some(scratch));
                session.events().publish(SessionEvent::Launched {
                    binary_version: target.binary_version.to_string(),
                    driver_version: target.driver_version.to_string(),
                });
                session.set_state(SessionState::Ready);
                session.events().publish(SessionEvent::Ready);
                self.verify_fingerprint(&session, profile).await;
                Ok(session)
            }
            Err(err) => {
                if let Err(kill_err) = child.kill().await {
                    tracing::debug!(session = %id, %kill_err, "kill after failed handshake");
                }
                let _ = child.wait().await;
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                Err(err)
            }
        }
    }

    /// Readiness means the control channel answers, not that the process
    /// exists: poll `/json/version`, find the page target, connect, probe.
    async fn handshake(
        &self,
        child: &mut Child,
        port: u16,
        timeout: Duration,
    ) -> Result<std::sync::Arc<ControlClient>, LaunchError> {
        let deadline = Instant::now() + timeout;
        let version_url = format!("http://127.0.0.1:{port}/json/version");
        let list_url = format!("http://127.0.0.1:{port}/json");

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LaunchError::CrashOnStartup {
                        detail: format!("process exited with {status} before the endpoint came up"),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(LaunchError::CrashOnStartup {
                        detail: format!("process became unwaitable: {err}"),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::HandshakeTimeout(timeout));
            }

            if let Some(info) = self.fetch_json::<BrowserInfo>(&version_url).await {
                tracing::debug!(browser = %info.browser, port, "devtools endpoint up");
                if let Some(ws_url) = self.page_ws_url(&list_url).await {
                    match ControlClient::connect(&ws_url).await {
                        Ok(control) => match control.probe(HANDSHAKE_PROBE_TIMEOUT).await {
                            Ok(()) => return Ok(control),
                            Err(err) => {
                                tracing::debug!(%err, "handshake probe unanswered, retrying");
                                control.close().await;
                            }
                        },
                        Err(err) => {
                            tracing::debug!(%err, "websocket connect failed, retrying");
                        }
                    }
                }
            }

            tokio::time::sleep(ENDPOINT_POLL_INTERVAL).await;
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let response = self.http.get(url).send().await.ok()?;
        response.json::<T>().await.ok()
    }

    async fn page_ws_url(&self, list_url: &str) -> Option<Url> {
        let targets = self.fetch_json::<Vec<PageTarget>>(list_url).await?;
        let ws = targets
            .into_iter()
            .find(|t| t.target_type == "page")
            .and_then(|t| t.ws_url)?;
        Url::parse(&ws).ok()
    }

    /// A session that launched but presents the wrong fingerprint gets
    /// blocked minutes later with nothing in the logs to explain it.
    /// Logging the effective user agent up front makes that a grep.
    /// Best-effort only.
    async fn verify_fingerprint(&self, session: &Session, profile: &SessionProfile) {
        match session.evaluate("navigator.userAgent").await {
            Ok(serde_json::Value::String(effective)) => {
                if let Some(requested) = &profile.user_agent {
                    if &effective != requested {
                        tracing::warn!(
                            session = %session.id(),
                            %effective,
                            %requested,
                            "user agent override not in effect"
                        );
                        return;
                    }
                }
                tracing::info!(session = %session.id(), user_agent = %effective, "fingerprint verified");
            }
            Ok(other) => {
                tracing::debug!(session = %session.id(), ?other, "unexpected userAgent value");
            }
            Err(err) => {
                tracing::debug!(session = %session.id(), %err, "fingerprint verification skipped");
            }
        }
    }
}
