/// Config schema types (server, transport, session, storage).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

/// Where the backend lives and who we are to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP base URL of the backend. The socket URL is derived from it
    /// (`http` → `ws`, `https` → `wss`).
    pub base_url: String,

    /// Identifier sent as `user_id` on outbound chat messages.
    pub user_id: String,

    /// Timeout for session API requests, in milliseconds.
    pub http_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            user_id: "default_user".into(),
            http_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Connection manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Minimum spacing between caller-initiated connection attempts.
    pub min_connect_interval_ms: u64,

    /// How long to wait for the close handshake before dropping the socket.
    pub close_grace_ms: u64,

    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_connect_interval_ms: 2_000,
            close_grace_ms: 500,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn min_connect_interval(&self) -> Duration {
        Duration::from_millis(self.min_connect_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Liveness probing over an open socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Answer server-sent `ping` frames with `pong`.
    pub respond_to_ping: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 25_000,
            timeout_ms: 8_000,
            respond_to_ping: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff schedule for automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            growth_factor: 2.0,
        }
    }
}

/// Session resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session reused (or created) when nothing is persisted.
    pub default_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_name: "Default Session".into(),
        }
    }
}

/// Durable local state (current session, transcripts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Override for the data directory. Defaults to `~/.tether/`.
    pub data_dir: Option<PathBuf>,

    /// Maximum transcript entries restored per session.
    pub transcript_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            transcript_limit: 500,
        }
    }
}
