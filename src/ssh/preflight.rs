//! SSH Host Key Preflight
//!
//! Initiates an SSH handshake only to capture the gateway's host key, then
//! aborts before authentication. Used for interactive trust establishment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Config};
use russh::keys::PublicKey;
use tracing::debug;

use super::error::SshError;

/// Handler that captures the host key and aborts the handshake
struct PreflightHandler {
    captured: Arc<Mutex<Option<PublicKey>>>,
}

impl client::Handler for PreflightHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        *self.captured.lock() = Some(server_public_key.clone());
        // Abort here, preflight never authenticates
        Err(SshError::HostKeyUnresolved("preflight check complete".to_string()))
    }
}

/// Resolve `host:port` to the first socket address
pub(crate) async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, SshError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            SshError::TransportUnreachable(format!("Failed to resolve {}:{}: {}", host, port, e))
        })?
        .next()
        .ok_or_else(|| SshError::TransportUnreachable(format!("No address found for {}", host)))
}

/// Fetch the host key the gateway presents
pub async fn fetch_host_key(host: &str, port: u16, timeout: Duration) -> Result<PublicKey, SshError> {
    let socket_addr = resolve_addr(host, port).await?;
    debug!("Starting host key preflight for {}", socket_addr);

    let captured = Arc::new(Mutex::new(None));
    let handler = PreflightHandler {
        captured: captured.clone(),
    };

    let ssh_config = Config {
        inactivity_timeout: Some(timeout),
        ..Default::default()
    };

    // Expected to fail once the key has been captured
    let connect_result = tokio::time::timeout(
        timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await;

    if let Some(key) = captured.lock().take() {
        return Ok(key);
    }

    match connect_result {
        Ok(Ok(_)) => Err(SshError::HostKeyUnresolved(
            "handshake completed without presenting a host key".to_string(),
        )),
        Ok(Err(e)) => Err(SshError::TransportUnreachable(format!(
            "Connection to {}:{} failed: {}",
            host, port, e
        ))),
        Err(_) => Err(SshError::TransportUnreachable(format!(
            "Connection to {}:{} timed out after {}s",
            host,
            port,
            timeout.as_secs()
        ))),
    }
}
