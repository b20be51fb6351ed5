//! Control-channel client.
//!
//! Design decisions, kept deliberately narrow:
//! 1. Single WebSocket per session - this core drives exactly one page.
//! 2. Request/response matching via id, events fanned out via broadcast.
//! 3. Every command carries a timeout; an unanswered command is an error,
//!    not a hang.
//! 4. Fail fast after disconnect - a closed flag makes probes cheap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::{CommandId, ControlEvent, ControlMessage, ControlRequest, ControlResponse};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("command {method} unanswered after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("control channel closed")]
    Closed,
}

pub struct ControlClient {
    next_id: AtomicU64,
    pending: Arc<DashMap<CommandId, oneshot::Sender<ControlResponse>>>,
    sink: Mutex<WsSink>,
    events: broadcast::Sender<ControlEvent>,
    closed: Arc<AtomicBool>,
}

impl ControlClient {
    /// Connect to the page's DevTools WebSocket and start the reader task.
    pub async fn connect(ws_url: &Url) -> Result<Arc<Self>, ControlError> {
        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (sink, mut stream) = ws_stream.split();
        let (events, _) = broadcast::channel(256);

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            sink: Mutex::new(sink),
            events: events.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        });

        let pending = client.pending.clone();
        let closed = client.closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ControlMessage>(&text)
                    {
                        Ok(ControlMessage::Response(response)) => {
                            if let Some((_, tx)) = pending.remove(&response.id) {
                                let _ = tx.send(response);
                            } else {
                                tracing::warn!(id = response.id, "reply for unknown command");
                            }
                        }
                        Ok(ControlMessage::Event(event)) => {
                            let _ = events.send(event);
                        }
                        Err(err) => {
                            tracing::debug!(%err, "unparseable control frame dropped");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(%err, "control socket error");
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every in-flight command with Closed.
            pending.clear();
        });

        Ok(client)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a command and wait (bounded) for its reply.
    pub async fn command(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        if self.is_closed() {
            return Err(ControlError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = ControlRequest {
            id,
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let json = serde_json::to_string(&request)?;
        {
            let mut sink = self.sink.lock().await;
            if let Err(err) = sink.send(Message::Text(json)).await {
                self.pending.remove(&id);
                return Err(ControlError::WebSocket(err));
            }
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ControlError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                return Err(ControlError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(ControlError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Lightweight liveness round-trip used by the handshake and by the
    /// supervisor's periodic health check.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ControlError> {
        self.command(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": "1", "returnByValue": true })),
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Subscribe to protocol events (crash notifications etc).
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Close the socket. The reader task winds down on its own; in-flight
    /// commands resolve to [`ControlError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.close().await {
            tracing::debug!(%err, "control socket close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Socket-level behavior needs a live Chrome; covered by the ignored
    // end-to-end test in `orchestrator.rs`.

    #[test]
    fn timeout_error_names_the_method() {
        let err = ControlError::Timeout {
            method: "Runtime.evaluate".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("Runtime.evaluate"));
    }
}
