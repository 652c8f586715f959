//! Gateway Authentication
//!
//! Selects exactly one credential method per session:
//! - Key authentication when key material is present and parses
//! - Password authentication otherwise
//!
//! The method is resolved once and never re-evaluated or retried with
//! another method for the same session.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use tracing::{debug, info, warn};

use super::error::SshError;

/// Credentials for the gateway
#[derive(Clone, Default)]
pub struct GatewayCredentials {
    /// Username on the gateway
    pub user: String,
    /// Private key material (OpenSSH / PEM text)
    pub private_key: Option<String>,
    /// Passphrase for encrypted key material
    pub passphrase: Option<String>,
    /// Password
    pub password: Option<String>,
}

impl GatewayCredentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_private_key(mut self, material: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key = Some(material.into());
        self.passphrase = passphrase;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Read key material from a file
    pub fn with_private_key_file(
        self,
        path: impl AsRef<Path>,
        passphrase: Option<String>,
    ) -> Result<Self, SshError> {
        let path = path.as_ref();
        let material = std::fs::read_to_string(path).map_err(|e| {
            SshError::Configuration(format!("Failed to read identity file {:?}: {}", path, e))
        })?;
        Ok(self.with_private_key(material, passphrase))
    }
}

// Secrets stay out of logs
impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("user", &self.user)
            .field("has_private_key", &self.private_key.is_some())
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

/// The single authentication method used for a session
#[derive(Clone)]
pub enum AuthMethod {
    /// Public key authentication with a parsed private key
    Key { key: Arc<PrivateKey> },
    /// Password authentication
    Password { password: String },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl AuthMethod {
    /// Pick the method for these credentials
    ///
    /// Key auth wins whenever the key material parses. Unparsable key
    /// material falls back to a password if one is configured.
    pub fn select(credentials: &GatewayCredentials) -> Result<Self, SshError> {
        if let Some(material) = &credentials.private_key {
            match decode_private_key(material, credentials.passphrase.as_deref()) {
                Ok(key) => {
                    debug!("Using key authentication ({})", key.algorithm());
                    return Ok(AuthMethod::Key { key: Arc::new(key) });
                }
                Err(e) if credentials.password.is_some() => {
                    warn!("Private key unusable ({}), falling back to password authentication", e);
                }
                Err(e) => {
                    return Err(SshError::AuthenticationFailed(format!(
                        "private key could not be loaded: {}",
                        e
                    )));
                }
            }
        }

        match &credentials.password {
            Some(password) => {
                debug!("Using password authentication");
                Ok(AuthMethod::Password {
                    password: password.clone(),
                })
            }
            None => Err(SshError::Configuration(
                "no credentials: supply a private key or a password".to_string(),
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Key { .. } => "publickey",
            AuthMethod::Password { .. } => "password",
        }
    }

    /// Run this method once against the gateway
    pub async fn authenticate<A>(&self, user: &str, authenticator: &mut A) -> Result<(), SshError>
    where
        A: Authenticator + ?Sized,
    {
        let accepted = match self {
            AuthMethod::Key { key } => authenticator.authenticate_publickey(user, key.clone()).await,
            AuthMethod::Password { password } => {
                authenticator.authenticate_password(user, password).await
            }
        }
        .map_err(|e| match e {
            SshError::AuthenticationFailed(_) => e,
            other => SshError::AuthenticationFailed(other.to_string()),
        })?;

        if !accepted {
            return Err(SshError::AuthenticationFailed(format!(
                "{} authentication rejected by server for user {}",
                self.label(),
                user
            )));
        }

        info!("SSH authentication successful ({})", self.label());
        Ok(())
    }
}

/// Transport that can run a single authentication attempt
#[async_trait]
pub trait Authenticator: Send {
    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<bool, SshError>;

    async fn authenticate_password(&mut self, user: &str, password: &str)
        -> Result<bool, SshError>;
}

#[derive(Debug, thiserror::Error)]
enum KeyDecodeError {
    #[error("encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("failed to parse key: {0}")]
    Parse(String),
}

fn decode_private_key(material: &str, passphrase: Option<&str>) -> Result<PrivateKey, KeyDecodeError> {
    let is_encrypted =
        material.contains("ENCRYPTED") || material.contains("Proc-Type: 4,ENCRYPTED");

    if is_encrypted && passphrase.is_none() {
        return Err(KeyDecodeError::PassphraseRequired);
    }

    russh::keys::decode_secret_key(material, passphrase).map_err(|e| {
        let msg = e.to_string();
        if passphrase.is_some() && (msg.contains("decrypt") || msg.contains("password")) {
            KeyDecodeError::InvalidPassphrase
        } else {
            KeyDecodeError::Parse(msg)
        }
    })
}
