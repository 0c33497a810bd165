//! Wire protocol for session sockets: envelope tags, close codes, and the
//! message shapes exchanged with the server.
//!
//! Every frame is a JSON object `{"type": <tag>, ...}`. Inbound frames are
//! normalized into [`InboundMessage`] before they reach consumers; outbound
//! frames are built from [`OutboundMessage`].

pub mod inbound;
pub mod outbound;

pub use {
    inbound::{ChatMessage, InboundMessage, SenderKind},
    outbound::OutboundMessage,
};

/// Envelope `type` tags known to the client.
pub mod tags {
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const AGENT_RESPONSE: &str = "agent_response";
    pub const STREAM_START: &str = "stream_start";
    pub const STREAM_CHUNK: &str = "stream_chunk";
    pub const STREAM_END: &str = "stream_end";
    pub const ERROR: &str = "error";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const SESSION_DELETED: &str = "session_deleted";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// WebSocket close codes used by the transport.
pub mod close_codes {
    /// Caller-initiated (or server-initiated) orderly shutdown. Never retried.
    pub const NORMAL: u16 = 1000;
    /// Close frame without a status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame (read error, EOF, failed open).
    pub const ABNORMAL: u16 = 1006;
    /// Forced by the client when a heartbeat ping goes unanswered.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;

    /// Whether a close with this code ends the connection for good.
    pub fn is_normal(code: u16) -> bool {
        code == NORMAL
    }
}

/// Path template for a session socket, relative to the server root.
pub fn session_path(session_id: &str) -> String {
    format!("/ws/session/{session_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_1000_is_normal() {
        assert!(close_codes::is_normal(close_codes::NORMAL));
        assert!(!close_codes::is_normal(close_codes::NO_STATUS));
        assert!(!close_codes::is_normal(close_codes::ABNORMAL));
        assert!(!close_codes::is_normal(close_codes::HEARTBEAT_TIMEOUT));
    }

    #[test]
    fn session_path_has_trailing_slash() {
        assert_eq!(session_path("abc"), "/ws/session/abc/");
    }
}
