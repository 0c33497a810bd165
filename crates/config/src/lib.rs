//! Configuration loading: `tether.{toml,yaml,yml,json}` discovery, `${ENV}`
//! substitution, and the typed schema shared by the other crates.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        apply_env_overrides, clear_config_dir, config_dir, data_dir, discover_and_load,
        load_config, set_config_dir,
    },
    schema::{
        HeartbeatConfig, ReconnectConfig, ServerConfig, SessionConfig, StorageConfig,
        TetherConfig, TransportConfig,
    },
};
