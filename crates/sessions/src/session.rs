use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Prefix of identifiers generated when the session API is unreachable.
pub const LOCAL_PREFIX: &str = "local-";

/// Where a session identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    /// Listed or created through the session API.
    Server,
    /// Generated locally because the session API could not be reached.
    Local,
}

/// The conversation context a socket is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub origin: SessionOrigin,
}

impl Session {
    pub fn server(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: now_ms(),
            origin: SessionOrigin::Server,
        }
    }

    /// A fresh `local-<uuid>` session for degraded mode.
    pub fn local() -> Self {
        Self {
            id: format!("{LOCAL_PREFIX}{}", uuid::Uuid::new_v4()),
            created_at: now_ms(),
            origin: SessionOrigin::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == SessionOrigin::Local
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
