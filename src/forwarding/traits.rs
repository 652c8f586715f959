use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::ssh::SshError;

/// Trait for streams that can be used for forwarding.
pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed forward streams.
pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// A shared transport that forwarders open channels on.
///
/// Implementations must allow concurrent `open_direct_tcpip` calls from
/// many tasks.
#[async_trait]
pub trait ForwardSession: Clone + Send + Sync + 'static {
    /// Open a `direct-tcpip` channel to `target_host:target_port`.
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<ForwardStream, SshError>;

    fn is_closed(&self) -> bool;

    /// Resolves once the transport is gone.
    async fn closed(&self);

    /// Disconnect the transport. Closing twice is a no-op.
    async fn close(&self);
}

/// Produces an authenticated session.
#[async_trait]
pub trait Establish: Send + Sync {
    type Session: ForwardSession;

    async fn establish(&self) -> Result<Self::Session, SshError>;
}
