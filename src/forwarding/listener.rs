//! Tunnel Listener Set
//!
//! One local TCP listener per tunnel spec. Binding is all-or-nothing: a
//! failure closes every listener opened so far. Each listener then runs its
//! own accept loop, independent of the others.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::forwarder::{forward_connection, signalled, ForwarderContext};
use super::registry::ConnectionRegistry;
use super::traits::ForwardSession;
use crate::config::{TunnelSet, TunnelSpec};
use crate::ssh::SshError;

/// Settings shared by every accept loop
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    pub dial_timeout: Duration,
    pub close_grace: Duration,
    pub accept_backoff: Duration,
    pub max_connections_per_tunnel: Option<usize>,
}

/// What an accept loop needs to hand connections off
pub struct AcceptContext<S> {
    pub session: S,
    pub registry: Arc<ConnectionRegistry>,
    pub options: AcceptOptions,
    /// Stop accepting and close the listener
    pub stop_accept: watch::Receiver<bool>,
    /// Force-close in-flight connections
    pub force_close: watch::Receiver<bool>,
}

impl<S: Clone> Clone for AcceptContext<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            registry: self.registry.clone(),
            options: self.options.clone(),
            stop_accept: self.stop_accept.clone(),
            force_close: self.force_close.clone(),
        }
    }
}

struct TunnelListener {
    index: usize,
    spec: Arc<TunnelSpec>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Bound listeners, one per spec, in spec order
pub struct TunnelListenerSet {
    listeners: Vec<TunnelListener>,
}

impl TunnelListenerSet {
    /// Bind every spec or none
    pub async fn bind(tunnels: &TunnelSet) -> Result<Self, SshError> {
        let mut bound: Vec<TunnelListener> = Vec::with_capacity(tunnels.len());

        for (index, spec) in tunnels.specs().iter().enumerate() {
            let result = TcpListener::bind((spec.local_bind_address.as_str(), spec.local_port))
                .await
                .and_then(|listener| {
                    let local_addr = listener.local_addr()?;
                    Ok((listener, local_addr))
                });

            match result {
                Ok((listener, local_addr)) => {
                    info!(
                        "Tunnel listening on {} -> {}",
                        local_addr,
                        spec.remote_addr()
                    );
                    bound.push(TunnelListener {
                        index,
                        spec: Arc::new(spec.clone()),
                        listener,
                        local_addr,
                    });
                }
                Err(e) => {
                    let opened = bound.len();
                    drop(bound);
                    error!(
                        "Failed to bind {}: {} (closed {} listeners opened so far)",
                        spec.local_addr(),
                        e,
                        opened
                    );
                    return Err(SshError::bind_failed(spec.local_addr(), &e));
                }
            }
        }

        Ok(Self { listeners: bound })
    }

    /// Actual bound addresses, in spec order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Start one accept loop per listener
    pub fn spawn<S: ForwardSession>(self, ctx: AcceptContext<S>) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|listener| tokio::spawn(run_accept_loop(listener, ctx.clone())))
            .collect()
    }
}

async fn run_accept_loop<S: ForwardSession>(tunnel: TunnelListener, ctx: AcceptContext<S>) {
    let TunnelListener {
        index,
        spec,
        listener,
        local_addr,
    } = tunnel;
    let mut stop = ctx.stop_accept.clone();
    let limiter = ctx
        .options
        .max_connections_per_tunnel
        .map(|max| Arc::new(Semaphore::new(max)));

    loop {
        let permit = match &limiter {
            Some(limiter) => tokio::select! {
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = signalled(&mut stop) => break,
            },
            None => None,
        };

        tokio::select! {
            _ = signalled(&mut stop) => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("Accepted connection from {} on {}", peer, local_addr);
                    spawn_forwarder(&ctx, index, spec.clone(), stream, peer, permit);
                }
                Err(e) => {
                    warn!("Accept error on {}: {}", local_addr, e);
                    tokio::select! {
                        _ = tokio::time::sleep(ctx.options.accept_backoff) => {}
                        _ = signalled(&mut stop) => break,
                    }
                }
            },
        }
    }

    drop(listener);
    info!("Tunnel listener {} closed", local_addr);
}

fn spawn_forwarder<S: ForwardSession>(
    ctx: &AcceptContext<S>,
    index: usize,
    spec: Arc<TunnelSpec>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
) {
    let guard = ctx.registry.register(index, peer);
    let id = guard.id();

    let forwarder = ForwarderContext {
        session: ctx.session.clone(),
        spec: spec.clone(),
        stats: ctx.registry.stats_handle(index),
        dial_timeout: ctx.options.dial_timeout,
        close_grace: ctx.options.close_grace,
        force_close: ctx.force_close.clone(),
    };

    let task = tokio::spawn(async move {
        let _permit = permit;
        let _guard = guard;
        if let Err(e) = forward_connection(forwarder, stream, peer).await {
            warn!("Forward connection error on {}: {}", spec, e);
        }
    });
    ctx.registry.attach_abort(id, task.abort_handle());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::testing::pick_free_port;

    #[tokio::test]
    async fn test_binds_one_listener_per_spec() {
        let tunnels = TunnelSet::parse(&["0:a:80", "0:b:443", "0:c:22"], "127.0.0.1").unwrap();
        let set = TunnelListenerSet::bind(&tunnels).await.unwrap();
        assert_eq!(set.len(), 3);

        let addrs = set.local_addrs();
        for addr in &addrs {
            assert_ne!(addr.port(), 0);
            tokio::net::TcpStream::connect(addr).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let first_port = pick_free_port();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = occupied.local_addr().unwrap().port();

        let rules = [
            format!("{}:a:80", first_port),
            format!("{}:b:80", occupied_port),
        ];
        let tunnels = TunnelSet::parse(&rules[..], "127.0.0.1").unwrap();

        let err = TunnelListenerSet::bind(&tunnels).await.err().unwrap();
        match err {
            SshError::TunnelBindFailed { reason, .. } => {
                assert_eq!(reason, crate::ssh::BindFailureReason::AddrInUse)
            }
            other => panic!("unexpected error: {other}"),
        }

        // The first listener was released
        std::net::TcpListener::bind(("127.0.0.1", first_port)).unwrap();
    }
}
