//! Connection Forwarder
//!
//! Bridges one accepted local connection to the tunnel's fixed remote
//! endpoint over a `direct-tcpip` channel:
//! 1. Dials the channel (bounded by the dial timeout)
//! 2. Runs one copy task per direction
//! 3. When either direction ends, propagates EOF and gives the other
//!    direction a grace period before the pair is force-closed

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::registry::SharedStats;
use super::traits::ForwardSession;
use crate::config::TunnelSpec;
use crate::ssh::SshError;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Everything a forwarder needs besides the local socket
pub struct ForwarderContext<S> {
    pub session: S,
    pub spec: Arc<TunnelSpec>,
    pub stats: SharedStats,
    pub dial_timeout: Duration,
    pub close_grace: Duration,
    /// Engine-wide force-close signal
    pub force_close: watch::Receiver<bool>,
}

/// Resolves once `rx` is set, or once its sender is gone
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Single close path for a (local, remote) pair
struct PairCloser {
    tx: watch::Sender<bool>,
}

impl PairCloser {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Idempotent; only the first call has an effect
    fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }
}

/// Aborts both copy tasks on drop; they never outlive their forwarder
struct CopyTasks([AbortHandle; 2]);

impl Drop for CopyTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    fn record(self, stats: &SharedStats, n: usize) {
        let mut s = stats.write();
        match self {
            Direction::Upstream => s.bytes_sent += n as u64,
            Direction::Downstream => s.bytes_received += n as u64,
        }
    }
}

/// Copy one direction until EOF, error, or a close signal, then shut the writer down
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    stats: SharedStats,
    close_grace: Duration,
    mut pair_closed: watch::Receiver<bool>,
    mut force_close: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let pump = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            writer.write_all(&buf[..n]).await?;
            direction.record(&stats, n);
        }
    };

    let result = tokio::select! {
        r = pump => r,
        _ = signalled(&mut pair_closed) => Ok(()),
        _ = signalled(&mut force_close) => Ok(()),
    };

    // Propagate EOF; shutting down a closed stream just errors, which is ignored
    let _ = tokio::time::timeout(close_grace, writer.shutdown()).await;
    debug!("{:?} copy finished", direction);
    result
}

/// Forward one accepted connection; failures stay local to this connection
pub async fn forward_connection<S: ForwardSession>(
    ctx: ForwarderContext<S>,
    local: TcpStream,
    peer: SocketAddr,
) -> Result<(), SshError> {
    let ForwarderContext {
        session,
        spec,
        stats,
        dial_timeout,
        close_grace,
        mut force_close,
    } = ctx;

    let origin_host = peer.ip().to_string();
    let dial = tokio::time::timeout(
        dial_timeout,
        session.open_direct_tcpip(&spec.remote_host, spec.remote_port, &origin_host, peer.port()),
    );

    let remote = tokio::select! {
        dialed = dial => match dialed {
            Ok(result) => result?,
            Err(_) => {
                return Err(SshError::Timeout(format!(
                    "channel to {} not opened within {}s",
                    spec.remote_addr(),
                    dial_timeout.as_secs_f32()
                )))
            }
        },
        _ = signalled(&mut force_close) => {
            debug!("Engine stopping, abandoning dial to {}", spec.remote_addr());
            return Ok(());
        }
    };

    debug!("Bridging {} to {}", peer, spec.remote_addr());

    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    let closer = PairCloser::new();

    let mut upstream = tokio::spawn(copy_half(
        local_read,
        remote_write,
        Direction::Upstream,
        stats.clone(),
        close_grace,
        closer.subscribe(),
        force_close.clone(),
    ));
    let mut downstream = tokio::spawn(copy_half(
        remote_read,
        local_write,
        Direction::Downstream,
        stats,
        close_grace,
        closer.subscribe(),
        force_close,
    ));
    let _copy_tasks = CopyTasks([upstream.abort_handle(), downstream.abort_handle()]);

    let (first, first_result) = tokio::select! {
        r = &mut upstream => (Direction::Upstream, r),
        r = &mut downstream => (Direction::Downstream, r),
    };
    debug!("{:?} side of {} ended first", first, peer);

    let other = match first {
        Direction::Upstream => &mut downstream,
        Direction::Downstream => &mut upstream,
    };

    let other_result = match tokio::time::timeout(close_grace, &mut *other).await {
        Ok(r) => r,
        Err(_) => {
            debug!("Grace period elapsed for {}, closing both sides", peer);
            closer.close();
            other.await
        }
    };
    closer.close();

    debug!("Forward connection from {} closed", peer);

    for result in [first_result, other_result] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SshError::IoError(e)),
            Err(e) => {
                warn!("Copy task for {} failed: {}", peer, e);
                return Err(SshError::ChannelError(e.to_string()));
            }
        }
    }
    Ok(())
}
