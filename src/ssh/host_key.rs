//! Gateway host key resolution
//!
//! Resolution order:
//! 1. Trusted entry in the known_hosts store
//! 2. Operator-supplied public key file
//! 3. Interactive trust: fetch the key via preflight and ask the operator
//!
//! Newly learned keys are appended to the store.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PublicKey;
use tracing::{info, warn};

use super::error::SshError;
use super::known_hosts::KnownHostsStore;
use super::preflight::fetch_host_key;

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeySource {
    TrustStore,
    KeyFile,
    Interactive,
}

/// Gateway keys the session will be pinned to
#[derive(Debug, Clone)]
pub struct ResolvedHostKey {
    /// Never empty; the handshake accepts any one of them
    pub keys: Vec<PublicKey>,
    pub source: HostKeySource,
}

impl ResolvedHostKey {
    pub fn fingerprints(&self) -> Vec<String> {
        self.keys.iter().map(KnownHostsStore::fingerprint).collect()
    }
}

/// Asks whether an unknown gateway key should be trusted
pub trait TrustPrompt: Send + Sync {
    fn confirm(&self, host: &str, port: u16, key_type: &str, fingerprint: &str) -> bool;
}

/// Built-in prompt policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Ask on the terminal
    Stdin,
    /// Trust on first use without asking
    AcceptNew,
    /// Never trust unknown keys
    Reject,
}

impl TrustPrompt for TrustPolicy {
    fn confirm(&self, host: &str, port: u16, key_type: &str, fingerprint: &str) -> bool {
        match self {
            TrustPolicy::AcceptNew => {
                info!(
                    "TOFU: trusting new host key for {}:{} ({} {})",
                    host, port, key_type, fingerprint
                );
                true
            }
            TrustPolicy::Reject => {
                warn!(
                    "Unknown host key for {}:{} ({} {}), non-interactive mode rejects it",
                    host, port, key_type, fingerprint
                );
                false
            }
            TrustPolicy::Stdin => prompt_stdin(host, port, key_type, fingerprint).unwrap_or_else(|e| {
                warn!("Host key prompt failed: {}", e);
                false
            }),
        }
    }
}

fn prompt_stdin(host: &str, port: u16, key_type: &str, fingerprint: &str) -> io::Result<bool> {
    let mut stderr = io::stderr();
    writeln!(
        stderr,
        "The authenticity of host '{}:{}' can't be established.",
        host, port
    )?;
    writeln!(stderr, "{} key fingerprint is {}.", key_type, fingerprint)?;
    write!(stderr, "Are you sure you want to continue connecting (yes/no)? ")?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "yes" | "y"))
}

/// Source of the key a gateway presents during a handshake
#[async_trait]
pub trait HostKeyFetcher: Send + Sync {
    async fn fetch(&self, host: &str, port: u16) -> Result<PublicKey, SshError>;
}

/// Fetches keys with a preflight handshake
pub struct PreflightFetcher {
    pub timeout: Duration,
}

#[async_trait]
impl HostKeyFetcher for PreflightFetcher {
    async fn fetch(&self, host: &str, port: u16) -> Result<PublicKey, SshError> {
        fetch_host_key(host, port, self.timeout).await
    }
}

pub struct HostKeyResolver {
    store: Arc<KnownHostsStore>,
    key_file: Option<PathBuf>,
    prompt: Arc<dyn TrustPrompt>,
    fetcher: Arc<dyn HostKeyFetcher>,
}

impl HostKeyResolver {
    pub fn new(store: Arc<KnownHostsStore>, prompt: Arc<dyn TrustPrompt>, timeout: Duration) -> Self {
        Self {
            store,
            key_file: None,
            prompt,
            fetcher: Arc::new(PreflightFetcher { timeout }),
        }
    }

    /// Operator-supplied public key file, consulted after the store
    pub fn with_key_file(mut self, path: Option<PathBuf>) -> Self {
        self.key_file = path;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HostKeyFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub async fn resolve(&self, host: &str, port: u16) -> Result<ResolvedHostKey, SshError> {
        let keys = self.store.trusted_keys(host, port);
        if !keys.is_empty() {
            info!(
                "{} host key(s) for {}:{} found in {:?}",
                keys.len(),
                host,
                port,
                self.store.path()
            );
            return Ok(ResolvedHostKey {
                keys,
                source: HostKeySource::TrustStore,
            });
        }

        if let Some(path) = &self.key_file {
            let key = read_public_key_file(path)?;
            info!(
                "Host key for {}:{} loaded from {:?} ({})",
                host,
                port,
                path,
                KnownHostsStore::fingerprint(&key)
            );
            self.persist(host, port, &key);
            return Ok(ResolvedHostKey {
                keys: vec![key],
                source: HostKeySource::KeyFile,
            });
        }

        let key = self.fetcher.fetch(host, port).await?;
        let fingerprint = KnownHostsStore::fingerprint(&key);
        let key_type = KnownHostsStore::key_type_name(&key);

        let prompt = self.prompt.clone();
        let (prompt_host, prompt_fp, prompt_type) = (host.to_string(), fingerprint.clone(), key_type.clone());
        let trusted = tokio::task::spawn_blocking(move || {
            prompt.confirm(&prompt_host, port, &prompt_type, &prompt_fp)
        })
        .await
        .map_err(|e| SshError::HostKeyUnresolved(format!("trust prompt failed: {}", e)))?;

        if !trusted {
            return Err(SshError::HostKeyUnresolved(format!(
                "host key for {}:{} ({}) was not trusted",
                host, port, fingerprint
            )));
        }

        self.persist(host, port, &key);
        Ok(ResolvedHostKey {
            keys: vec![key],
            source: HostKeySource::Interactive,
        })
    }

    fn persist(&self, host: &str, port: u16, key: &PublicKey) {
        if let Err(e) = self.store.add_host(host, port, key) {
            warn!("Failed to save host key for {}:{}: {}", host, port, e);
        }
    }
}

/// Parse `<type> <base64> [comment]` or a bare base64 blob
fn read_public_key_file(path: &Path) -> Result<PublicKey, SshError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SshError::HostKeyUnresolved(format!("cannot read host key file {:?}: {}", path, e))
    })?;

    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| SshError::HostKeyUnresolved(format!("host key file {:?} is empty", path)))?;

    let mut fields = line.split_whitespace();
    let first = fields.next().unwrap_or_default();
    let blob = fields.next().unwrap_or(first);

    russh::keys::parse_public_key_base64(blob).map_err(|e| {
        SshError::HostKeyUnresolved(format!("invalid public key in {:?}: {}", path, e))
    })
}
