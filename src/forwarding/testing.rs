//! Test doubles: a mock gateway session and loopback remote endpoints

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::traits::{Establish, ForwardSession, ForwardStream};
use crate::ssh::SshError;

/// Session whose channels are plain TCP connections to routed loopback servers
#[derive(Clone)]
pub(crate) struct MockSession {
    routes: Arc<Mutex<HashMap<(String, u16), SocketAddr>>>,
    stalled: Arc<Mutex<HashSet<String>>>,
    dials: Arc<Mutex<Vec<String>>>,
    closed_tx: Arc<watch::Sender<bool>>,
    close_calls: Arc<AtomicUsize>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            routes: Arc::default(),
            stalled: Arc::default(),
            dials: Arc::default(),
            closed_tx: Arc::new(closed_tx),
            close_calls: Arc::default(),
        }
    }

    /// Channels to `host:port` connect to `addr`
    pub(crate) fn route(&self, host: &str, port: u16, addr: SocketAddr) {
        self.routes.lock().insert((host.to_string(), port), addr);
    }

    /// Channel opens to `host` never complete
    pub(crate) fn stall(&self, host: &str) {
        self.stalled.lock().insert(host.to_string());
    }

    /// Simulate the transport dying
    pub(crate) fn fail_transport(&self) {
        self.closed_tx.send_replace(true);
    }

    pub(crate) fn dials(&self) -> Vec<String> {
        self.dials.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForwardSession for MockSession {
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<ForwardStream, SshError> {
        self.dials.lock().push(format!(
            "{}:{} <- {}:{}",
            target_host, target_port, origin_host, origin_port
        ));

        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        if self.stalled.lock().contains(target_host) {
            std::future::pending::<()>().await;
        }

        let addr = self
            .routes
            .lock()
            .get(&(target_host.to_string(), target_port))
            .copied()
            .ok_or_else(|| {
                SshError::ChannelError(format!("no route to {}:{}", target_host, target_port))
            })?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }
}

/// Hands out a clone of one session, or a fixed failure
pub(crate) struct MockEstablisher {
    pub(crate) session: MockSession,
    pub(crate) failure: Option<fn() -> SshError>,
}

#[async_trait]
impl Establish for MockEstablisher {
    type Session = MockSession;

    async fn establish(&self) -> Result<MockSession, SshError> {
        match self.failure {
            Some(make_error) => Err(make_error()),
            None => Ok(self.session.clone()),
        }
    }
}

/// Loopback echo server recording what each connection received
pub(crate) struct EchoServer {
    pub(crate) addr: SocketAddr,
    /// Bytes received per connection, pushed once the client sends EOF
    pub(crate) received: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub(crate) async fn spawn_echo_server() -> EchoServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let record = received.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let record = record.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                record.lock().push(seen);
                let _ = stream.shutdown().await;
            });
        }
    });

    EchoServer { addr, received }
}

/// Loopback server that writes `greeting` and hangs up
pub(crate) async fn spawn_hangup_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });

    addr
}

/// Reserve a port number that is free right now
pub(crate) fn pick_free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}
