//! Per-session event bus.
//!
//! Publishes lifecycle transitions to live observers and records them with
//! timestamps; the recorded history is what lands in the Log artifact when
//! a session dies.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::FailureKind;

/// Lifecycle notifications emitted by the factory and the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Launched {
        binary_version: String,
        driver_version: String,
    },
    Ready,
    TaskStarted,
    ProbeMissed { detail: String },
    TargetCrashed,
    DeadlineExceeded,
    Cancelled,
    Failed { kind: FailureKind },
    Closing,
    Closed,
}

/// One recorded bus entry.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    history: std::sync::Mutex<Vec<RecordedEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Record and broadcast. No subscribers is fine.
    pub fn publish(&self, event: SessionEvent) {
        if let Ok(mut history) = self.history.lock() {
            history.push(RecordedEvent {
                at: Utc::now(),
                event: event.clone(),
            });
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of everything published so far, in order.
    pub fn history(&self) -> Vec<RecordedEvent> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_and_history() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::Ready);
        bus.publish(SessionEvent::Closing);

        match rx.recv().await {
            Ok(SessionEvent::Ready) => {}
            other => panic!("expected Ready, got {other:?}"),
        }

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[1].event, SessionEvent::Closing));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::Closed);
        assert_eq!(bus.history().len(), 1);
    }
}
