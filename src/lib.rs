//! OxideTunnel - SSH local port forwarding engine
//!
//! Opens one authenticated SSH session to a gateway and bridges any number of
//! local listeners to fixed remote endpoints over `direct-tcpip` channels.

pub mod config;
pub mod engine;
pub mod forwarding;
pub mod ssh;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{TunnelConfig, TunnelSet, TunnelSpec};
pub use engine::{EngineOptions, EngineState, RunningEngine, TunnelEngine};
pub use ssh::{ErrorKind, SshError};

use ssh::{AuthMethod, HostKeyPolicy, HostKeyResolver, KnownHostsStore, SessionEstablisher};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve how the gateway's host key will be checked
async fn host_key_policy(config: &TunnelConfig) -> Result<HostKeyPolicy, SshError> {
    if config.host_keys.accept_any {
        return Ok(HostKeyPolicy::AcceptAny);
    }

    let store = Arc::new(KnownHostsStore::open(config.host_keys.known_hosts_path()));
    let resolver = HostKeyResolver::new(
        store,
        Arc::new(config.host_keys.trust_policy()),
        config.engine_options().connect_timeout,
    )
    .with_key_file(config.host_keys.host_key_file.clone());

    let resolved = resolver
        .resolve(&config.gateway.host, config.gateway.port)
        .await?;
    info!(
        "Host key for {} resolved from {:?}: {}",
        config.gateway.host,
        resolved.source,
        resolved.fingerprints().join(", ")
    );
    Ok(HostKeyPolicy::Pinned(resolved.keys))
}

/// SIGINT/SIGTERM handlers, registered before any tunnel opens
struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
}

impl ShutdownSignal {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(windows)]
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    /// Resolves on the first signal
    async fn recv(mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => info!("Received SIGTERM"),
                _ = self.sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(windows)]
        {
            self.ctrl_c.recv().await;
            info!("Received Ctrl-C");
        }
    }
}

/// Run tunnels from `config` until interrupted or the gateway goes away
pub async fn run(config: TunnelConfig) -> Result<(), SshError> {
    config.validate()?;
    let tunnels = config.tunnel_set()?;
    let options = config.engine_options();
    let credentials = config.credentials()?;
    // Unusable credentials must fail before the trust store can change
    let auth = AuthMethod::select(&credentials)?;
    let shutdown = ShutdownSignal::install()?;

    let host_key = host_key_policy(&config).await?;
    let establisher = SessionEstablisher::from_auth(
        config.gateway.host.clone(),
        config.gateway.port,
        &credentials.user,
        auth,
        host_key,
        options.connect_timeout,
    )?;
    info!(
        "Authenticating to {}@{}:{} with {}",
        config.gateway.user,
        config.gateway.host,
        config.gateway.port,
        establisher.auth_method().label()
    );

    let specs = tunnels.specs().to_vec();
    let engine = TunnelEngine::new(tunnels, options)
        .start(&establisher)
        .await?;

    for (spec, addr) in specs.iter().zip(engine.local_addrs()) {
        info!("{} -> {}", addr, spec.remote_addr());
    }

    engine.run_until(shutdown.recv()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unusable_key_fails_before_host_key_is_trusted() {
        let dir = tempdir().unwrap();
        let identity = dir.path().join("id_ed25519");
        std::fs::write(&identity, "not a private key\n").unwrap();
        let known_hosts = dir.path().join("known_hosts");

        // Nothing listens here; a host key fetch would fail as unreachable
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = TunnelConfig::default();
        config.gateway.host = "127.0.0.1".to_string();
        config.gateway.port = port;
        config.gateway.user = "deploy".to_string();
        config.gateway.identity_file = Some(identity);
        config.tunnels = vec!["0:db:5432".to_string()];
        config.host_keys.known_hosts = Some(known_hosts.clone());
        config.host_keys.trust_new = true;

        let err = run(config).await.unwrap_err();
        assert!(matches!(err, SshError::AuthenticationFailed(_)), "{err}");
        assert!(!known_hosts.exists());
    }

    #[tokio::test]
    async fn test_shutdown_signal_waits_for_a_signal() {
        let shutdown = ShutdownSignal::install().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(100), shutdown.recv()).await;
        assert!(waited.is_err(), "shutdown resolved without a signal");
    }
}
