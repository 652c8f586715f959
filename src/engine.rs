//! Tunnel Engine
//!
//! Owns the gateway session, the listener set and the connection registry
//! for one run.
//!
//! # State machine
//!
//! ```text
//! Idle -> Authenticating -> Running -> Draining -> Stopped
//!              |                                     ^
//!              +-------- auth / bind failure --------+
//! ```
//!
//! Draining closes every listener first, waits for in-flight connections up
//! to `shutdown_deadline`, force-closes what remains and disconnects the
//! session last.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::TunnelSet;
use crate::forwarding::{
    signalled, AcceptContext, AcceptOptions, ConnectionRegistry, Establish, ForwardSession,
    ForwardStats, TunnelListenerSet,
};
use crate::ssh::SshError;

/// Extra time granted to forwarders after the force-close signal
const FORCE_CLOSE_SLACK: Duration = Duration::from_secs(1);

/// How long aborted forwarders get to release their registry entries
const ABORT_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Authenticating,
    Running,
    Draining,
    Stopped,
}

/// Timeouts and limits for one engine run
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on connecting and authenticating to the gateway
    pub connect_timeout: Duration,
    /// Bound on opening one remote channel
    pub dial_timeout: Duration,
    /// Time the surviving direction gets after its peer direction ended
    pub close_grace: Duration,
    /// Time in-flight connections get to finish once draining starts
    pub shutdown_deadline: Duration,
    /// Pause after a transient accept error
    pub accept_backoff: Duration,
    /// Per-tunnel cap on concurrent connections, `None` for unlimited
    pub max_connections_per_tunnel: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
            shutdown_deadline: Duration::from_secs(5),
            accept_backoff: Duration::from_millis(100),
            max_connections_per_tunnel: None,
        }
    }
}

impl EngineOptions {
    fn accept_options(&self) -> AcceptOptions {
        AcceptOptions {
            dial_timeout: self.dial_timeout,
            close_grace: self.close_grace,
            accept_backoff: self.accept_backoff,
            max_connections_per_tunnel: self.max_connections_per_tunnel,
        }
    }
}

type StateSender = Arc<watch::Sender<EngineState>>;

fn set_state(state_tx: &StateSender, state: EngineState) {
    let previous = state_tx.send_replace(state);
    if previous != state {
        info!("Tunnel engine {:?} -> {:?}", previous, state);
    }
}

/// An engine that has not been started yet
pub struct TunnelEngine {
    tunnels: TunnelSet,
    options: EngineOptions,
    state_tx: StateSender,
}

impl TunnelEngine {
    pub fn new(tunnels: TunnelSet, options: EngineOptions) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        Self {
            tunnels,
            options,
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Observe state changes, including the ones made during `start`
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Authenticate, bind every listener and begin accepting.
    ///
    /// Fails with the establisher's error on authentication problems, or with
    /// `TunnelBindFailed` once the session has been closed again. Either way
    /// the engine ends in `Stopped`.
    pub async fn start<E: Establish>(
        self,
        establisher: &E,
    ) -> Result<RunningEngine, SshError> {
        let Self {
            tunnels,
            options,
            state_tx,
        } = self;

        set_state(&state_tx, EngineState::Authenticating);

        let session = match establisher.establish().await {
            Ok(session) => session,
            Err(e) => {
                error!("Gateway session failed: {}", e);
                set_state(&state_tx, EngineState::Stopped);
                return Err(e);
            }
        };

        let listeners = match TunnelListenerSet::bind(&tunnels).await {
            Ok(listeners) => listeners,
            Err(e) => {
                session.close().await;
                set_state(&state_tx, EngineState::Stopped);
                return Err(e);
            }
        };
        let local_addrs = listeners.local_addrs();

        let registry = Arc::new(ConnectionRegistry::new(tunnels.len()));
        let (stop_accept_tx, stop_accept_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let accept_tasks = listeners.spawn(AcceptContext {
            session: session.clone(),
            registry: registry.clone(),
            options: options.accept_options(),
            stop_accept: stop_accept_rx,
            force_close: force_rx,
        });

        set_state(&state_tx, EngineState::Running);
        info!("Forwarding {} tunnel(s)", local_addrs.len());

        let supervisor = tokio::spawn(supervise(Supervisor {
            session,
            registry: registry.clone(),
            accept_tasks,
            stop_accept_tx,
            force_tx,
            stop_rx,
            state_tx: state_tx.clone(),
            shutdown_deadline: options.shutdown_deadline,
            close_grace: options.close_grace,
        }));

        Ok(RunningEngine {
            local_addrs,
            registry,
            state_tx,
            stop_tx,
            supervisor,
        })
    }
}

/// Handle to an engine that reached `Running`
pub struct RunningEngine {
    local_addrs: Vec<SocketAddr>,
    registry: Arc<ConnectionRegistry>,
    state_tx: StateSender,
    stop_tx: watch::Sender<bool>,
    supervisor: JoinHandle<Result<(), SshError>>,
}

impl RunningEngine {
    /// Bound listener addresses, in tunnel order
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self, tunnel: usize) -> Option<ForwardStats> {
        self.registry.stats(tunnel)
    }

    pub fn active_connections(&self) -> usize {
        self.registry.active()
    }

    pub fn active_for(&self, tunnel: usize) -> usize {
        self.registry.active_for(tunnel)
    }

    /// Request a stop and return once the engine is `Stopped`
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let mut state = self.state_tx.subscribe();
        let _ = state.wait_for(|s| *s == EngineState::Stopped).await;
    }

    /// Resolve when the engine stops for any reason.
    ///
    /// Returns `TransportFailure` if the gateway session was lost.
    pub async fn wait(self) -> Result<(), SshError> {
        let Self {
            supervisor,
            stop_tx,
            ..
        } = self;
        let result = supervisor.await;
        drop(stop_tx);
        supervisor_result(result)
    }

    /// Run until `shutdown` resolves or the session is lost.
    ///
    /// `shutdown` cannot fail: signal handlers are installed by the caller
    /// before the engine starts, so a failed install never reads as a stop.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), SshError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = &mut self.supervisor => return supervisor_result(result),
            _ = shutdown => {
                info!("Shutdown requested");
                self.stop_tx.send_replace(true);
            }
        }
        self.wait().await
    }
}

fn supervisor_result(result: Result<Result<(), SshError>, JoinError>) -> Result<(), SshError> {
    match result {
        Ok(result) => result,
        Err(e) => Err(SshError::ProtocolError(format!(
            "engine supervisor failed: {}",
            e
        ))),
    }
}

struct Supervisor<S> {
    session: S,
    registry: Arc<ConnectionRegistry>,
    accept_tasks: Vec<JoinHandle<()>>,
    stop_accept_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    state_tx: StateSender,
    shutdown_deadline: Duration,
    close_grace: Duration,
}

async fn supervise<S: ForwardSession>(sup: Supervisor<S>) -> Result<(), SshError> {
    let Supervisor {
        session,
        registry,
        accept_tasks,
        stop_accept_tx,
        force_tx,
        mut stop_rx,
        state_tx,
        shutdown_deadline,
        close_grace,
    } = sup;

    let failure = tokio::select! {
        _ = signalled(&mut stop_rx) => None,
        _ = session.closed() => {
            error!("Gateway transport lost");
            Some(SshError::TransportFailure(
                "gateway connection closed".to_string(),
            ))
        }
    };

    set_state(&state_tx, EngineState::Draining);

    // No new accepts from here on
    stop_accept_tx.send_replace(true);
    for task in accept_tasks {
        if let Err(e) = task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
    }

    if !registry.wait_idle(shutdown_deadline).await {
        warn!(
            "{} connection(s) still active after {:?}, forcing close",
            registry.active(),
            shutdown_deadline
        );
        force_tx.send_replace(true);

        if !registry.wait_idle(close_grace + FORCE_CLOSE_SLACK).await {
            let aborted = registry.abort_all();
            warn!("Aborted {} stuck forwarder(s)", aborted);
            registry.wait_idle(ABORT_SETTLE).await;
        }
    }

    session.close().await;
    set_state(&state_tx, EngineState::Stopped);

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
