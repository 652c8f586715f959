//! Configuration Management Module
//!
//! Tunnel rule parsing and the JSON configuration file.

pub mod storage;
pub mod tunnel_spec;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use tunnel_spec::{TunnelSet, TunnelSpec, DEFAULT_BIND_ADDRESS};
pub use types::{
    GatewayConfig, HostKeyConfig, TimeoutConfig, TunnelConfig, CONFIG_VERSION, DEFAULT_SSH_PORT,
};
