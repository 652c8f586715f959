//! Active connection registry
//!
//! Tracks every live forwarded connection for Draining accounting and keeps
//! per-tunnel statistics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::debug;

/// Statistics for one tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> client)
    pub bytes_received: u64,
}

pub type SharedStats = Arc<RwLock<ForwardStats>>;

struct ConnectionEntry {
    tunnel: usize,
    peer: SocketAddr,
    started: Instant,
    abort: Option<AbortHandle>,
}

pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<u64, ConnectionEntry>,
    stats: Vec<SharedStats>,
}

impl ConnectionRegistry {
    pub fn new(tunnels: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            stats: (0..tunnels).map(|_| SharedStats::default()).collect(),
        }
    }

    /// Record a new connection; it stays active until the guard drops
    pub fn register(self: &Arc<Self>, tunnel: usize, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            ConnectionEntry {
                tunnel,
                peer,
                started: Instant::now(),
                abort: None,
            },
        );
        if let Some(stats) = self.stats.get(tunnel) {
            let mut s = stats.write();
            s.connection_count += 1;
            s.active_connections += 1;
        }
        ConnectionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Attach the forwarding task so it can be aborted; no-op if it already finished
    pub fn attach_abort(&self, id: u64, handle: AbortHandle) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    fn release(&self, id: u64) {
        if let Some((_, entry)) = self.connections.remove(&id) {
            if let Some(stats) = self.stats.get(entry.tunnel) {
                let mut s = stats.write();
                s.active_connections = s.active_connections.saturating_sub(1);
            }
            debug!(
                "Connection from {} released after {:?}",
                entry.peer,
                entry.started.elapsed()
            );
        }
    }

    pub fn stats_handle(&self, tunnel: usize) -> SharedStats {
        self.stats.get(tunnel).cloned().unwrap_or_default()
    }

    pub fn stats(&self, tunnel: usize) -> Option<ForwardStats> {
        self.stats.get(tunnel).map(|s| s.read().clone())
    }

    pub fn active(&self) -> usize {
        self.connections.len()
    }

    pub fn active_for(&self, tunnel: usize) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.tunnel == tunnel)
            .count()
    }

    /// Wait until no connection is active, up to `deadline`
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while !self.connections.is_empty() {
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Abort every tracked forwarding task, returning how many were aborted
    pub fn abort_all(&self) -> usize {
        // Collect first, a cancelled task releases its entry from the map
        let handles: Vec<AbortHandle> = self
            .connections
            .iter()
            .filter_map(|entry| entry.abort.clone())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

/// Keeps a connection registered while alive
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_and_release() {
        let registry = Arc::new(ConnectionRegistry::new(2));
        let a = registry.register(0, peer());
        let b = registry.register(1, peer());
        assert_eq!(registry.active(), 2);
        assert_eq!(registry.active_for(0), 1);

        drop(a);
        assert_eq!(registry.active(), 1);
        let stats = registry.stats(0).unwrap();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);

        drop(b);
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_deadline() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let guard = registry.register(0, peer());
        assert!(!registry.wait_idle(Duration::from_millis(100)).await);

        drop(guard);
        assert!(registry.wait_idle(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_abort_all_releases_guard() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let guard = registry.register(0, peer());
        let id = guard.id();
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        registry.attach_abort(id, task.abort_handle());

        assert_eq!(registry.abort_all(), 1);
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(registry.active(), 0);
    }
}
