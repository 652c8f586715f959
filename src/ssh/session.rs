//! Authenticated gateway session
//!
//! Wraps the russh `Handle` so that every forwarder can open
//! `direct-tcpip` channels concurrently. The russh multiplexer serializes
//! frames internally; a slow channel open only blocks its caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SshError;
use crate::forwarding::{ForwardSession, ForwardStream};

/// How often the transport is checked for closure
const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared handle to the authenticated transport
#[derive(Clone)]
pub struct GatewaySession {
    handle: Arc<Handle<ClientHandler>>,
    label: Arc<str>,
}

impl GatewaySession {
    pub(crate) fn new(handle: Handle<ClientHandler>, label: String) -> Self {
        info!("Gateway session established: {}", label);
        Self {
            handle: Arc::new(handle),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl ForwardSession for GatewaySession {
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<ForwardStream, SshError> {
        if self.handle.is_closed() {
            return Err(SshError::Disconnected);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target_host,
                target_port as u32,
                origin_host,
                origin_port as u32,
            )
            .await
            .map_err(|e| {
                SshError::ChannelError(format!(
                    "direct-tcpip to {}:{} refused: {}",
                    target_host, target_port, e
                ))
            })?;

        debug!(
            "Opened channel for forward to {}:{} on {}",
            target_host, target_port, self.label
        );
        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn closed(&self) {
        while !self.handle.is_closed() {
            tokio::time::sleep(TRANSPORT_POLL_INTERVAL).await;
        }
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel engine stopped", "en")
            .await;
        info!("Gateway session closed: {}", self.label);
    }
}
