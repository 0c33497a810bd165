use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Who authored a chat record, as far as the UI cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
    System,
}

impl SenderKind {
    /// Classify a raw `sender` field. The server sends usernames for human
    /// senders, so anything that is not a known agent/system marker is a user.
    pub fn classify(sender: Option<&str>, message_type: Option<&str>) -> Self {
        if message_type == Some("system") {
            return Self::System;
        }
        match sender.map(str::to_ascii_lowercase).as_deref() {
            Some("agent" | "assistant" | "bot") => Self::Agent,
            Some("system") => Self::System,
            _ => Self::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

fn default_message_type() -> String {
    "text".into()
}

/// Uniform chat record delivered for both `chat_message` and
/// `agent_response` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: SenderKind,
    /// Raw sender label (username, orchestrator name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// A normalized inbound frame, as seen by message subscribers.
///
/// Streaming frames are surfaced one by one; reassembling chunks is left to
/// the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundMessage {
    ConnectionEstablished {
        session_id: Option<String>,
        message: Option<String>,
        timestamp: Option<String>,
    },
    Chat(ChatMessage),
    AgentResponse(ChatMessage),
    StreamStart {
        message: Option<String>,
    },
    StreamChunk {
        chunk: String,
        full_content: Option<String>,
    },
    StreamEnd {
        full_content: Option<String>,
    },
    Error {
        message: String,
    },
    TaskCompleted {
        task_id: String,
        agent_name: Option<String>,
        status: Option<String>,
        result: Value,
    },
    /// A deletion notice for a session other than the active one.
    SessionDeleted {
        session_id: String,
    },
    /// A well-formed frame with a tag this client does not know.
    Unhandled {
        #[serde(rename = "type")]
        kind: String,
        payload: Value,
    },
}

impl InboundMessage {
    /// The envelope tag this message was built from.
    pub fn tag(&self) -> &str {
        use crate::tags;
        match self {
            Self::ConnectionEstablished { .. } => tags::CONNECTION_ESTABLISHED,
            Self::Chat(_) => tags::CHAT_MESSAGE,
            Self::AgentResponse(_) => tags::AGENT_RESPONSE,
            Self::StreamStart { .. } => tags::STREAM_START,
            Self::StreamChunk { .. } => tags::STREAM_CHUNK,
            Self::StreamEnd { .. } => tags::STREAM_END,
            Self::Error { .. } => tags::ERROR,
            Self::TaskCompleted { .. } => tags::TASK_COMPLETED,
            Self::SessionDeleted { .. } => tags::SESSION_DELETED,
            Self::Unhandled { kind, .. } => kind.as_str(),
        }
    }

    /// The chat record carried by this message, if any.
    pub fn as_chat(&self) -> Option<&ChatMessage> {
        match self {
            Self::Chat(m) | Self::AgentResponse(m) => Some(m),
            _ => None,
        }
    }
}
