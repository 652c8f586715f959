//! Configuration Types
//!
//! The JSON configuration file. Every field has a default so a partial file
//! (or none at all, with everything on the command line) is valid.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::tunnel_spec::{TunnelSet, DEFAULT_BIND_ADDRESS};
use crate::engine::EngineOptions;
use crate::ssh::{GatewayCredentials, KnownHostsStore, SshError, TrustPolicy};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_true() -> bool {
    true
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Config format version
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Tunnel rules, `[bind:]localPort:remoteHost:remotePort`
    #[serde(default)]
    pub tunnels: Vec<String>,

    /// Bind address for rules without one
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub host_keys: HostKeyConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Per-tunnel connection cap
    #[serde(default)]
    pub max_connections_per_tunnel: Option<usize>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            gateway: GatewayConfig::default(),
            tunnels: Vec::new(),
            bind_address: default_bind_address(),
            host_keys: HostKeyConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_connections_per_tunnel: None,
        }
    }
}

/// Gateway address and credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Private key file
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: String::new(),
            identity_file: None,
            passphrase: None,
            password: None,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("identity_file", &self.identity_file)
            .field("has_passphrase", &self.passphrase.is_some())
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

/// How the gateway host key is established
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyConfig {
    /// Trust store, defaults to `~/.ssh/known_hosts`
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    /// Operator-supplied public key file
    #[serde(default)]
    pub host_key_file: Option<PathBuf>,
    /// Skip host key verification entirely
    #[serde(default)]
    pub accept_any: bool,
    /// Trust unknown keys on first use without asking
    #[serde(default)]
    pub trust_new: bool,
    /// Ask on the terminal for unknown keys
    #[serde(default = "default_true")]
    pub interactive: bool,
}

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self {
            known_hosts: None,
            host_key_file: None,
            accept_any: false,
            trust_new: false,
            interactive: true,
        }
    }
}

impl HostKeyConfig {
    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path)
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        if self.trust_new {
            TrustPolicy::AcceptNew
        } else if self.interactive {
            TrustPolicy::Stdin
        } else {
            TrustPolicy::Reject
        }
    }
}

/// Timeouts, in seconds unless noted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

fn default_connect_secs() -> u64 {
    30
}

fn default_dial_secs() -> u64 {
    10
}

fn default_close_grace_ms() -> u64 {
    2000
}

fn default_shutdown_secs() -> u64 {
    5
}

fn default_accept_backoff_ms() -> u64 {
    100
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            dial_secs: default_dial_secs(),
            close_grace_ms: default_close_grace_ms(),
            shutdown_deadline_secs: default_shutdown_secs(),
            accept_backoff_ms: default_accept_backoff_ms(),
        }
    }
}

impl TunnelConfig {
    /// Check everything that can be checked before touching the network
    pub fn validate(&self) -> Result<(), SshError> {
        if self.gateway.host.is_empty() {
            return Err(SshError::Configuration("gateway host is required".to_string()));
        }
        if self.gateway.port == 0 {
            return Err(SshError::Configuration("gateway port must be non-zero".to_string()));
        }
        if self.gateway.user.is_empty() {
            return Err(SshError::Configuration("gateway user is required".to_string()));
        }
        if self.gateway.identity_file.is_none() && self.gateway.password.is_none() {
            return Err(SshError::Configuration(
                "either an identity file or a password is required".to_string(),
            ));
        }
        if self.timeouts.connect_secs == 0 || self.timeouts.dial_secs == 0 {
            return Err(SshError::Configuration(
                "connect and dial timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_connections_per_tunnel == Some(0) {
            return Err(SshError::Configuration(
                "max connections per tunnel must be at least 1".to_string(),
            ));
        }
        self.tunnel_set().map(|_| ())
    }

    pub fn tunnel_set(&self) -> Result<TunnelSet, SshError> {
        TunnelSet::parse(self.tunnels.as_slice(), &self.bind_address)
    }

    /// Build credentials, reading the identity file if one is set
    pub fn credentials(&self) -> Result<GatewayCredentials, SshError> {
        let mut credentials = GatewayCredentials::new(self.gateway.user.clone());
        if let Some(path) = &self.gateway.identity_file {
            credentials = credentials.with_private_key_file(path, self.gateway.passphrase.clone())?;
        }
        if let Some(password) = &self.gateway.password {
            credentials = credentials.with_password(password.clone());
        }
        Ok(credentials)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            dial_timeout: Duration::from_secs(self.timeouts.dial_secs),
            close_grace: Duration::from_millis(self.timeouts.close_grace_ms),
            shutdown_deadline: Duration::from_secs(self.timeouts.shutdown_deadline_secs),
            accept_backoff: Duration::from_millis(self.timeouts.accept_backoff_ms),
            max_connections_per_tunnel: self.max_connections_per_tunnel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::ErrorKind;

    fn valid_config() -> TunnelConfig {
        let mut config = TunnelConfig::default();
        config.gateway.host = "bastion.example.com".to_string();
        config.gateway.user = "deploy".to_string();
        config.gateway.password = Some("hunter2".to_string());
        config.tunnels = vec!["18080:db:5432".to_string()];
        config
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "gateway": { "host": "bastion", "user": "deploy", "password": "pw" },
            "tunnels": ["8080:db:5432"]
        }"#;
        let config: TunnelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.gateway.port, 22);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert!(config.host_keys.interactive);
        assert_eq!(config.timeouts.connect_secs, 30);
        config.validate().unwrap();

        let options = config.engine_options();
        assert_eq!(options.close_grace, Duration::from_secs(2));
        assert_eq!(options.accept_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_missing_remote_part_rejected_at_config_time() {
        let mut config = valid_config();
        config.tunnels = vec!["8080".to_string()];
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_requires_a_credential() {
        let mut config = valid_config();
        config.gateway.password = None;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_connection_cap_rejected() {
        let mut config = valid_config();
        config.max_connections_per_tunnel = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trust_policy_selection() {
        let mut host_keys = HostKeyConfig::default();
        assert_eq!(host_keys.trust_policy(), TrustPolicy::Stdin);
        host_keys.interactive = false;
        assert_eq!(host_keys.trust_policy(), TrustPolicy::Reject);
        host_keys.trust_new = true;
        assert_eq!(host_keys.trust_policy(), TrustPolicy::AcceptNew);
    }

    #[test]
    fn test_secrets_not_serialized_or_logged() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_missing_identity_file_is_configuration_error() {
        let mut config = valid_config();
        config.gateway.identity_file = Some(PathBuf::from("/nonexistent/id_ed25519"));
        assert_eq!(config.credentials().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
