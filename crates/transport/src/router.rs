use {
    serde::Deserialize,
    serde_json::{Map, Value, json},
};

use tether_protocol::{ChatMessage, InboundMessage, SenderKind, tags};

/// Where a parsed frame goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Server liveness check; answer with `pong`.
    Ping,
    /// Answer to our ping; clears the heartbeat timeout.
    Pong,
    /// The active session was deleted server-side; re-resolve and rebind.
    ActiveSessionDeleted { session_id: String },
    /// Hand to message subscribers.
    Deliver(InboundMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is not utf-8")]
    Binary,

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame has no string `type`")]
    MissingType,

    #[error("malformed `{tag}` frame: {reason}")]
    Shape { tag: String, reason: String },
}

/// Parses inbound frames and normalizes domain messages.
///
/// Knows which session the socket is bound to so that a deletion notice for
/// that session can be told apart from one for any other session.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    active_session: Option<String>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_session(&mut self, session_id: Option<String>) {
        self.active_session = session_id;
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Route a binary frame, decoded as UTF-8 first.
    pub fn route_binary(&self, bytes: &[u8]) -> Result<Route, RouteError> {
        let text = std::str::from_utf8(bytes).map_err(|_| RouteError::Binary)?;
        self.route(text)
    }

    pub fn route(&self, text: &str) -> Result<Route, RouteError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(obj) = value else {
            return Err(RouteError::NotAnObject);
        };
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(RouteError::MissingType)?
            .to_string();

        let message = match tag.as_str() {
            tags::PING => return Ok(Route::Ping),
            tags::PONG => return Ok(Route::Pong),
            tags::SESSION_DELETED => {
                let session_id = obj
                    .get("session_id")
                    .and_then(id_string)
                    .ok_or_else(|| shape(&tag, "missing `session_id`"))?;
                if self.active_session.as_deref() == Some(session_id.as_str()) {
                    return Ok(Route::ActiveSessionDeleted { session_id });
                }
                InboundMessage::SessionDeleted { session_id }
            },
            tags::CHAT_MESSAGE => InboundMessage::Chat(chat_message(&tag, obj)?),
            tags::AGENT_RESPONSE => InboundMessage::AgentResponse(agent_response(&tag, obj)?),
            tags::CONNECTION_ESTABLISHED => {
                let raw: RawEstablished = decode(&tag, obj)?;
                InboundMessage::ConnectionEstablished {
                    session_id: raw.session_id.as_ref().and_then(id_string),
                    message: raw.message,
                    timestamp: raw.timestamp,
                }
            },
            tags::STREAM_START => {
                let raw: RawStreamStart = decode(&tag, obj)?;
                InboundMessage::StreamStart {
                    message: raw.message,
                }
            },
            tags::STREAM_CHUNK => {
                let raw: RawStreamChunk = decode(&tag, obj)?;
                let chunk = raw
                    .chunk
                    .or(raw.content)
                    .ok_or_else(|| shape(&tag, "missing `chunk`"))?;
                InboundMessage::StreamChunk {
                    chunk,
                    full_content: raw.full_content,
                }
            },
            tags::STREAM_END => {
                let raw: RawStreamEnd = decode(&tag, obj)?;
                InboundMessage::StreamEnd {
                    full_content: raw.full_content,
                }
            },
            tags::ERROR => {
                let raw: RawError = decode(&tag, obj)?;
                let message = raw
                    .message
                    .or(raw.error)
                    .ok_or_else(|| shape(&tag, "missing `message`"))?;
                InboundMessage::Error { message }
            },
            tags::TASK_COMPLETED => {
                let raw: RawTaskCompleted = decode(&tag, obj)?;
                InboundMessage::TaskCompleted {
                    task_id: id_string(&raw.task_id)
                        .ok_or_else(|| shape(&tag, "invalid `task_id`"))?,
                    agent_name: raw.agent_name,
                    status: raw.status,
                    result: raw.result,
                }
            },
            _ => InboundMessage::Unhandled {
                kind: tag,
                payload: Value::Object(obj),
            },
        };
        Ok(Route::Deliver(message))
    }
}

// ── Raw frame shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawChatEnvelope {
    message: RawChat,
}

#[derive(Deserialize)]
struct RawChat {
    #[serde(default)]
    id: Option<Value>,
    content: String,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Deserialize)]
struct RawAgentEnvelope {
    response: RawAgentResponse,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    original_message_id: Option<Value>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAgentResponse {
    Text(String),
    Full {
        content: String,
        #[serde(default)]
        orchestrator: Option<String>,
        #[serde(default)]
        agent_id: Option<Value>,
        #[serde(default)]
        synthesized: Option<bool>,
    },
}

#[derive(Deserialize)]
struct RawEstablished {
    #[serde(default)]
    session_id: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct RawStreamStart {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawStreamChunk {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    full_content: Option<String>,
}

#[derive(Deserialize)]
struct RawStreamEnd {
    #[serde(default)]
    full_content: Option<String>,
}

#[derive(Deserialize)]
struct RawError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawTaskCompleted {
    task_id: Value,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Value,
}

fn decode<T: serde::de::DeserializeOwned>(tag: &str, obj: Map<String, Value>) -> Result<T, RouteError> {
    serde_json::from_value(Value::Object(obj)).map_err(|e| shape(tag, &e.to_string()))
}

fn shape(tag: &str, reason: &str) -> RouteError {
    RouteError::Shape {
        tag: tag.to_string(),
        reason: reason.to_string(),
    }
}

/// Identifiers arrive as strings (UUIDs) or integers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn chat_message(tag: &str, obj: Map<String, Value>) -> Result<ChatMessage, RouteError> {
    let RawChatEnvelope { message: raw } = decode(tag, obj)?;
    let sender = SenderKind::classify(raw.sender.as_deref(), raw.message_type.as_deref());
    Ok(ChatMessage {
        id: raw.id.as_ref().and_then(id_string).unwrap_or_default(),
        content: raw.content,
        sender,
        sender_name: raw.sender,
        message_type: raw.message_type.unwrap_or_else(|| "text".into()),
        timestamp: raw.timestamp,
        metadata: raw.metadata,
    })
}

fn agent_response(tag: &str, obj: Map<String, Value>) -> Result<ChatMessage, RouteError> {
    let raw: RawAgentEnvelope = decode(tag, obj)?;
    let original = raw.original_message_id.as_ref().and_then(id_string);

    let mut metadata = Map::new();
    if let Some(original) = &original {
        metadata.insert("original_message_id".into(), json!(original));
    }

    let (content, sender_name) = match raw.response {
        RawAgentResponse::Text(content) => (content, None),
        RawAgentResponse::Full {
            content,
            orchestrator,
            agent_id,
            synthesized,
        } => {
            let agent_id = agent_id.as_ref().and_then(id_string);
            if let Some(agent_id) = &agent_id {
                metadata.insert("agent_id".into(), json!(agent_id));
            }
            if let Some(orchestrator) = &orchestrator {
                metadata.insert("orchestrator".into(), json!(orchestrator));
            }
            if let Some(synthesized) = synthesized {
                metadata.insert("synthesized".into(), json!(synthesized));
            }
            (content, orchestrator.or(agent_id))
        },
    };

    let id = raw
        .id
        .as_ref()
        .and_then(id_string)
        .or_else(|| original.map(|o| format!("{o}:response")))
        .unwrap_or_default();

    Ok(ChatMessage {
        id,
        content,
        sender: SenderKind::Agent,
        sender_name,
        message_type: "text".into(),
        timestamp: raw.timestamp,
        metadata: if metadata.is_empty() {
            Value::Null
        } else {
            Value::Object(metadata)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> MessageRouter {
        let mut r = MessageRouter::new();
        r.set_active_session(Some("abc".into()));
        r
    }

    fn deliver(text: &str) -> InboundMessage {
        match router().route(text).unwrap() {
            Route::Deliver(m) => m,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn control_frames_are_not_delivered() {
        assert_eq!(router().route(r#"{"type":"ping"}"#).unwrap(), Route::Ping);
        assert_eq!(router().route(r#"{"type":"pong"}"#).unwrap(), Route::Pong);
    }

    #[test]
    fn chat_message_is_normalized() {
        let msg = deliver(
            r#"{"type":"chat_message","message":{"id":"1","content":"hi","sender":"user","timestamp":"T"}}"#,
        );
        let InboundMessage::Chat(chat) = msg else {
            panic!("expected chat");
        };
        assert_eq!(chat.id, "1");
        assert_eq!(chat.content, "hi");
        assert_eq!(chat.sender, SenderKind::User);
        assert_eq!(chat.sender_name.as_deref(), Some("user"));
        assert_eq!(chat.timestamp.as_deref(), Some("T"));
        assert_eq!(chat.message_type, "text");
    }

    #[test]
    fn chat_message_with_numeric_id_and_system_type() {
        let msg = deliver(
            r#"{"type":"chat_message","message":{"id":7,"content":"joined","sender":"Anonymous","message_type":"system"}}"#,
        );
        let chat = msg.as_chat().unwrap();
        assert_eq!(chat.id, "7");
        assert_eq!(chat.sender, SenderKind::System);
    }

    #[test]
    fn agent_response_object_and_string() {
        let msg = deliver(
            r#"{"type":"agent_response","response":{"content":"done","orchestrator":"planner","agent_id":3,"synthesized":true},"original_message_id":"m1","timestamp":"T"}"#,
        );
        let InboundMessage::AgentResponse(chat) = msg else {
            panic!("expected agent response");
        };
        assert_eq!(chat.sender, SenderKind::Agent);
        assert_eq!(chat.content, "done");
        assert_eq!(chat.id, "m1:response");
        assert_eq!(chat.sender_name.as_deref(), Some("planner"));
        assert_eq!(chat.metadata["agent_id"], "3");
        assert_eq!(chat.metadata["synthesized"], true);

        let msg = deliver(r#"{"type":"agent_response","response":"plain"}"#);
        let chat = msg.as_chat().unwrap();
        assert_eq!(chat.content, "plain");
        assert!(chat.metadata.is_null());
    }

    #[test]
    fn stream_lifecycle() {
        assert_eq!(
            deliver(r#"{"type":"stream_start","message":"thinking"}"#),
            InboundMessage::StreamStart {
                message: Some("thinking".into())
            }
        );
        assert_eq!(
            deliver(r#"{"type":"stream_chunk","content":"par","full_content":"par","done":false}"#),
            InboundMessage::StreamChunk {
                chunk: "par".into(),
                full_content: Some("par".into())
            }
        );
        assert_eq!(
            deliver(r#"{"type":"stream_end","full_content":"partial","done":true}"#),
            InboundMessage::StreamEnd {
                full_content: Some("partial".into())
            }
        );
    }

    #[test]
    fn error_and_task_completed() {
        assert_eq!(
            deliver(r#"{"type":"error","message":"boom"}"#),
            InboundMessage::Error {
                message: "boom".into()
            }
        );
        let msg = deliver(
            r#"{"type":"task_completed","task_id":42,"agent_name":"coder","status":"ok","result":{"files":2}}"#,
        );
        let InboundMessage::TaskCompleted {
            task_id, result, ..
        } = msg
        else {
            panic!("expected task_completed");
        };
        assert_eq!(task_id, "42");
        assert_eq!(result["files"], 2);
    }

    #[test]
    fn session_deleted_matches_active_only() {
        assert_eq!(
            router()
                .route(r#"{"type":"session_deleted","session_id":"abc"}"#)
                .unwrap(),
            Route::ActiveSessionDeleted {
                session_id: "abc".into()
            }
        );
        assert_eq!(
            deliver(r#"{"type":"session_deleted","session_id":"other"}"#),
            InboundMessage::SessionDeleted {
                session_id: "other".into()
            }
        );
    }

    #[test]
    fn unknown_tag_is_unhandled() {
        let msg = deliver(r#"{"type":"agent_status_update","agent":"a"}"#);
        let InboundMessage::Unhandled { kind, payload } = msg else {
            panic!("expected unhandled");
        };
        assert_eq!(kind, "agent_status_update");
        assert_eq!(payload["agent"], "a");
    }

    #[test]
    fn malformed_frames_are_errors() {
        let r = router();
        assert!(matches!(r.route("not json"), Err(RouteError::Json(_))));
        assert!(matches!(r.route("[1,2]"), Err(RouteError::NotAnObject)));
        assert!(matches!(r.route(r#"{"kind":"x"}"#), Err(RouteError::MissingType)));
        assert!(matches!(r.route(r#"{"type":5}"#), Err(RouteError::MissingType)));
        assert!(matches!(
            r.route(r#"{"type":"chat_message","message":"hi"}"#),
            Err(RouteError::Shape { .. })
        ));
        assert!(matches!(
            r.route(r#"{"type":"stream_chunk"}"#),
            Err(RouteError::Shape { .. })
        ));
        assert!(matches!(
            r.route(r#"{"type":"session_deleted"}"#),
            Err(RouteError::Shape { .. })
        ));
        assert!(matches!(r.route_binary(&[0xff, 0xfe]), Err(RouteError::Binary)));
    }

    #[test]
    fn binary_frames_are_decoded() {
        assert_eq!(router().route_binary(br#"{"type":"pong"}"#).unwrap(), Route::Pong);
    }
}
