use serde::{Deserialize, Serialize};

use crate::rag::SourceExcerpt;

#[derive(Debug, Deserialize, Default)]
pub struct WsIncomingMessage {
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub query: Option<String>,
}

impl WsIncomingMessage {
    pub fn is_stop(&self) -> bool {
        self.msg_type.as_deref() == Some("stop")
    }
}

/// Server frames. Every query ends with exactly one of `Done`, `Error` or
/// `Stopped`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoingMessage {
    Sources { data: Vec<SourceExcerpt> },
    Chunk { message: String },
    Done,
    Error { message: String },
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outgoing_frames_are_type_tagged() {
        let chunk = serde_json::to_value(WsOutgoingMessage::Chunk {
            message: "blue".into(),
        })
        .unwrap();
        assert_eq!(chunk, json!({"type": "chunk", "message": "blue"}));
        assert_eq!(
            serde_json::to_value(WsOutgoingMessage::Done).unwrap(),
            json!({"type": "done"})
        );
    }

    #[test]
    fn incoming_accepts_query_or_stop() {
        let query: WsIncomingMessage = serde_json::from_str(r#"{"query":"sky?"}"#).unwrap();
        assert_eq!(query.query.as_deref(), Some("sky?"));
        assert!(!query.is_stop());

        let stop: WsIncomingMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(stop.is_stop());
    }
}
