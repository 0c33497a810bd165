use std::time::Duration;

use crate::state::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("socket write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("connection manager has shut down")]
    Shutdown,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(e.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
