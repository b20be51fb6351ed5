//! Wire types for the DevTools control channel.
//!
//! Kept minimal: only the shapes the orchestration core exchanges. The
//! site-task collaborator composes its own method calls on top.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonically increasing per-connection command id.
pub type CommandId = u64;

/// Command sent to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    pub id: CommandId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Reply to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponse {
    pub id: CommandId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ProtocolError>,
}

/// Error object embedded in a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
}

/// Unsolicited event from the browser (no command id).
#[derive(Debug, Clone, Deserialize)]
pub struct ControlEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Any inbound frame: replies carry an `id`, events don't.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Response(ControlResponse),
    Event(ControlEvent),
}

/// Payload of `GET /json/version` on the DevTools HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserInfo {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "User-Agent", default)]
    pub user_agent: Option<String>,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

/// One entry of `GET /json` - an attachable target.
#[derive(Debug, Clone, Deserialize)]
pub struct PageTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_split_on_id() {
        let reply: ControlMessage =
            serde_json::from_str(r#"{"id":7,"result":{"value":1}}"#).unwrap();
        assert!(matches!(reply, ControlMessage::Response(r) if r.id == 7));

        let event: ControlMessage =
            serde_json::from_str(r#"{"method":"Inspector.targetCrashed","params":{}}"#).unwrap();
        assert!(matches!(
            event,
            ControlMessage::Event(e) if e.method == "Inspector.targetCrashed"
        ));
    }

    #[test]
    fn error_replies_deserialize() {
        let reply: ControlResponse =
            serde_json::from_str(r#"{"id":3,"error":{"code":-32601,"message":"unknown method"}}"#)
                .unwrap();
        let err = reply.error.unwrap();
        assert_eq!(err.code, -32601);
    }

    #[test]
    fn page_target_list_parses() {
        let raw = r#"[{"id":"T1","type":"page","title":"portal","url":"https://example.com",
                      "webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/page/T1"}]"#;
        let targets: Vec<PageTarget> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets[0].target_type, "page");
        assert!(targets[0].ws_url.is_some());
    }

    #[test]
    fn request_omits_empty_params() {
        let req = ControlRequest {
            id: 1,
            method: "Page.navigate".into(),
            params: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
    }
}
