//! Interaction transcript.
//!
//! Append-only for the lifetime of a session; flushed to the
//! `conversations/` artifact on close or failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One interaction with the portal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Navigation { url: String },
    Input { selector: String, value: String },
    Fragment { label: String, content: Value },
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptStep {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub step: Step,
}

#[derive(Debug, Default)]
pub struct Transcript {
    steps: std::sync::Mutex<Vec<TranscriptStep>>,
}

impl Transcript {
    pub fn record(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(TranscriptStep {
                at: Utc::now(),
                step,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TranscriptStep> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_keep_insertion_order() {
        let transcript = Transcript::default();
        transcript.record(Step::Navigation {
            url: "https://portal.example/login".into(),
        });
        transcript.record(Step::Input {
            selector: "#email".into(),
            value: "user@example.com".into(),
        });
        transcript.record(Step::Fragment {
            label: "price".into(),
            content: serde_json::json!({"amount": 129.0}),
        });

        let steps = transcript.snapshot();
        assert_eq!(steps.len(), 3);
        assert!(matches!(steps[0].step, Step::Navigation { .. }));
        assert!(matches!(steps[2].step, Step::Fragment { .. }));
    }

    #[test]
    fn serializes_tagged() {
        let transcript = Transcript::default();
        transcript.record(Step::Navigation {
            url: "https://portal.example".into(),
        });
        let json = serde_json::to_string(&transcript.snapshot()).unwrap();
        assert!(json.contains("\"step\":\"navigation\""));
    }
}
