//! Gateway session establishment using russh

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, PrivateKey, PublicKey, PublicKeyBase64};
use tracing::{debug, info, warn};

use super::auth::{AuthMethod, Authenticator, GatewayCredentials};
use super::error::SshError;
use super::known_hosts::KnownHostsStore;
use super::preflight::resolve_addr;
use super::session::GatewaySession;
use crate::forwarding::Establish;

/// What the handshake checks the server key against
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Any of these keys is accepted
    Pinned(Vec<PublicKey>),
    /// Compatibility toggle: any key is accepted (logged)
    AcceptAny,
}

impl HostKeyPolicy {
    /// Host key algorithms to offer, in russh's default preference order.
    ///
    /// When pinned, only algorithms some trusted key can satisfy are offered,
    /// so the gateway presents a key we hold. `None` keeps the defaults.
    pub fn host_key_algorithms(&self) -> Option<Vec<Algorithm>> {
        let HostKeyPolicy::Pinned(keys) = self else {
            return None;
        };

        let algorithms: Vec<Algorithm> = russh::Preferred::DEFAULT
            .key
            .iter()
            .filter(|offered| keys.iter().any(|key| same_key_type(&key.algorithm(), offered)))
            .cloned()
            .collect();

        if algorithms.is_empty() {
            None
        } else {
            Some(algorithms)
        }
    }
}

/// An `ssh-rsa` key signs with any of the rsa-sha2 variants
fn same_key_type(trusted: &Algorithm, offered: &Algorithm) -> bool {
    match (trusted, offered) {
        (Algorithm::Rsa { .. }, Algorithm::Rsa { .. }) => true,
        _ => trusted == offered,
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = KnownHostsStore::fingerprint(server_public_key);

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting host key for {}:{} without verification (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
            HostKeyPolicy::Pinned(trusted) => {
                let presented = server_public_key.public_key_bytes();
                if trusted.iter().any(|key| key.public_key_bytes() == presented) {
                    info!("Host key verified for {}:{}", self.host, self.port);
                    Ok(true)
                } else {
                    let expected = trusted
                        .iter()
                        .map(KnownHostsStore::fingerprint)
                        .collect::<Vec<_>>()
                        .join(", ");
                    warn!(
                        "HOST KEY MISMATCH for {}:{}! Expected one of [{}], got {}. POSSIBLE MITM ATTACK!",
                        self.host, self.port, expected, fingerprint
                    );
                    Err(SshError::HostKeyUnresolved(format!(
                        "host key for {}:{} does not match any trusted key. \
                         Expected one of: [{}], Actual: {}",
                        self.host, self.port, expected, fingerprint
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl Authenticator for client::Handle<ClientHandler> {
    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<bool, SshError> {
        let key_with_hash = PrivateKeyWithHashAlg::new(key, None);
        let result = client::Handle::authenticate_publickey(self, user, key_with_hash).await?;
        Ok(result.success())
    }

    async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<bool, SshError> {
        let result = client::Handle::authenticate_password(self, user, password).await?;
        Ok(result.success())
    }
}

/// Opens the single authenticated transport to the gateway
pub struct SessionEstablisher {
    host: String,
    port: u16,
    user: String,
    auth: AuthMethod,
    host_key: HostKeyPolicy,
    connect_timeout: Duration,
}

impl SessionEstablisher {
    /// Resolves the authentication method once, up front
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: &GatewayCredentials,
        host_key: HostKeyPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, SshError> {
        if credentials.user.is_empty() {
            return Err(SshError::Configuration("gateway user is empty".to_string()));
        }
        let auth = AuthMethod::select(credentials)?;
        Self::from_auth(host, port, &credentials.user, auth, host_key, connect_timeout)
    }

    /// Build from an already selected authentication method
    pub fn from_auth(
        host: impl Into<String>,
        port: u16,
        user: &str,
        auth: AuthMethod,
        host_key: HostKeyPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, SshError> {
        if user.is_empty() {
            return Err(SshError::Configuration("gateway user is empty".to_string()));
        }
        let host = host.into();

        if matches!(host_key, HostKeyPolicy::AcceptAny) {
            warn!(
                "Host key checking disabled for {}:{}, any key will be accepted",
                host, port
            );
        }

        Ok(Self {
            host,
            port,
            user: user.to_string(),
            auth,
            host_key,
            connect_timeout,
        })
    }

    pub fn auth_method(&self) -> &AuthMethod {
        &self.auth
    }

    async fn connect_and_authenticate(&self) -> Result<GatewaySession, SshError> {
        let socket_addr = resolve_addr(&self.host, self.port).await?;
        info!("Connecting to SSH gateway at {} ({})", self.host, socket_addr);

        let mut ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        if let Some(algorithms) = self.host_key.host_key_algorithms() {
            debug!(
                "Offering host key algorithms: {:?}",
                algorithms.iter().map(Algorithm::as_str).collect::<Vec<_>>()
            );
            ssh_config.preferred.key = Cow::Owned(algorithms);
        }

        let handler = ClientHandler::new(self.host.clone(), self.port, self.host_key.clone());

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                SshError::HostKeyUnresolved(_) => e,
                other => SshError::TransportUnreachable(format!(
                    "SSH handshake with {}:{} failed: {}",
                    self.host, self.port, other
                )),
            })?;

        debug!("SSH handshake completed");

        if let Err(e) = self.auth.authenticate(&self.user, &mut handle).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }

        Ok(GatewaySession::new(
            handle,
            format!("{}@{}:{}", self.user, self.host, self.port),
        ))
    }
}

#[async_trait]
impl Establish for SessionEstablisher {
    type Session = GatewaySession;

    async fn establish(&self) -> Result<GatewaySession, SshError> {
        tokio::time::timeout(self.connect_timeout, self.connect_and_authenticate())
            .await
            .map_err(|_| {
                SshError::TransportUnreachable(format!(
                    "Connection to {}:{} timed out after {}s",
                    self.host,
                    self.port,
                    self.connect_timeout.as_secs()
                ))
            })?
    }
}
