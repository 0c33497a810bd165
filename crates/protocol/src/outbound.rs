use {
    serde::Serialize,
    serde_json::{Value, json},
};

/// Frames the client writes to the session socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ChatMessage {
        content: String,
        user_id: String,
        message_type: String,
        metadata: Value,
    },
    Ping,
    Pong,
}

impl OutboundMessage {
    /// A plain-text chat message from `user_id`.
    pub fn chat(content: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::ChatMessage {
            content: content.into(),
            user_id: user_id.into(),
            message_type: "text".into(),
            metadata: json!({}),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_wire_shape() {
        let text = OutboundMessage::chat("hello", "u1").to_text().unwrap();
        assert_eq!(
            text,
            r#"{"type":"chat_message","content":"hello","user_id":"u1","message_type":"text","metadata":{}}"#
        );
    }

    #[test]
    fn control_frames() {
        assert_eq!(OutboundMessage::Ping.to_text().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(OutboundMessage::Pong.to_text().unwrap(), r#"{"type":"pong"}"#);
    }
}
