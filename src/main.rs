//! oxidetunnel - forward local ports through an SSH gateway

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oxidetunnel::config::{ConfigStorage, TunnelConfig};
use oxidetunnel::{ErrorKind, SshError};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Forward local ports to remote endpoints through one SSH gateway session
#[derive(Parser, Debug)]
#[command(name = "oxidetunnel")]
#[command(about = "SSH local port forwarding through a gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Gateway host, optionally as user@host
    gateway: Option<String>,

    /// JSON config file (defaults to ~/.oxidetunnel/config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// User on the gateway
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// Gateway SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Private key file
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long)]
    passphrase: Option<String>,

    /// Password, used when no usable private key is given
    #[arg(long, env = "OXIDETUNNEL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Tunnel rule, repeatable
    #[arg(short = 'L', long = "tunnel", value_name = "[BIND:]PORT:HOST:HOSTPORT")]
    tunnels: Vec<String>,

    /// Bind address for rules without one
    #[arg(long)]
    bind_address: Option<String>,

    /// Trust store file (defaults to ~/.ssh/known_hosts)
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Public key file for the gateway
    #[arg(long)]
    host_key_file: Option<PathBuf>,

    /// Skip host key verification
    #[arg(long)]
    accept_any_host_key: bool,

    /// Trust an unknown host key without asking
    #[arg(long)]
    trust_new_host_key: bool,

    /// Never prompt; unknown host keys are rejected
    #[arg(long)]
    non_interactive: bool,

    /// Gateway connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Channel open timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Shutdown deadline in seconds
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Per-tunnel connection cap
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Cli {
    /// Overlay command line values on the file config
    fn apply(self, config: &mut TunnelConfig) {
        if let Some(gateway) = self.gateway {
            match gateway.rsplit_once('@') {
                Some((user, host)) => {
                    config.gateway.user = user.to_string();
                    config.gateway.host = host.to_string();
                }
                None => config.gateway.host = gateway,
            }
        }
        if let Some(user) = self.user {
            config.gateway.user = user;
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(identity) = self.identity {
            config.gateway.identity_file = Some(identity);
        }
        if let Some(passphrase) = self.passphrase {
            config.gateway.passphrase = Some(passphrase);
        }
        if let Some(password) = self.password {
            config.gateway.password = Some(password);
        }
        if !self.tunnels.is_empty() {
            config.tunnels = self.tunnels;
        }
        if let Some(bind_address) = self.bind_address {
            config.bind_address = bind_address;
        }
        if let Some(known_hosts) = self.known_hosts {
            config.host_keys.known_hosts = Some(known_hosts);
        }
        if let Some(host_key_file) = self.host_key_file {
            config.host_keys.host_key_file = Some(host_key_file);
        }
        if self.accept_any_host_key {
            config.host_keys.accept_any = true;
        }
        if self.trust_new_host_key {
            config.host_keys.trust_new = true;
        }
        if self.non_interactive {
            config.host_keys.interactive = false;
        }
        if let Some(secs) = self.connect_timeout {
            config.timeouts.connect_secs = secs;
        }
        if let Some(secs) = self.dial_timeout {
            config.timeouts.dial_secs = secs;
        }
        if let Some(secs) = self.shutdown_timeout {
            config.timeouts.shutdown_deadline_secs = secs;
        }
        if let Some(max) = self.max_connections {
            config.max_connections_per_tunnel = Some(max);
        }
    }
}

async fn load_config(path: Option<&PathBuf>) -> Result<TunnelConfig, SshError> {
    match path {
        Some(path) => Ok(ConfigStorage::with_path(path).load_required().await?),
        None => match ConfigStorage::new() {
            Ok(storage) => Ok(storage.load().await?),
            Err(_) => Ok(TunnelConfig::default()),
        },
    }
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Configuration => 2,
        ErrorKind::HostKeyUnresolved => 3,
        ErrorKind::AuthenticationFailed => 4,
        ErrorKind::TransportUnreachable | ErrorKind::TransportFailure => 5,
        ErrorKind::ListenerBindFailure => 6,
        ErrorKind::PerConnectionFailure => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    oxidetunnel::init_logging();
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_ref()).await {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(exit_code(e.kind()));
        }
    };
    cli.apply(&mut config);

    match oxidetunnel::run(config).await {
        Ok(()) => {
            info!("All tunnels closed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(exit_code(e.kind()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_overrides_file_config() {
        let mut config = TunnelConfig::default();
        config.gateway.host = "old-bastion".to_string();
        config.gateway.port = 2222;
        config.tunnels = vec!["1:a:1".to_string()];

        let cli = Cli::try_parse_from([
            "oxidetunnel",
            "deploy@bastion.example.com",
            "-L",
            "18080:db:5432",
            "-L",
            "18081:cache:6379",
            "--non-interactive",
            "--dial-timeout",
            "3",
        ])
        .unwrap();
        cli.apply(&mut config);

        assert_eq!(config.gateway.host, "bastion.example.com");
        assert_eq!(config.gateway.user, "deploy");
        assert_eq!(config.gateway.port, 2222);
        assert_eq!(config.tunnels, vec!["18080:db:5432", "18081:cache:6379"]);
        assert!(!config.host_keys.interactive);
        assert_eq!(config.timeouts.dial_secs, 3);
    }

    #[test]
    fn test_exit_codes_distinguish_failures() {
        let bind = SshError::bind_failed(
            "127.0.0.1:8080",
            &std::io::Error::from(std::io::ErrorKind::AddrInUse),
        );
        let codes = [
            exit_code(SshError::Configuration("bad".into()).kind()),
            exit_code(SshError::HostKeyUnresolved("unknown".into()).kind()),
            exit_code(SshError::AuthenticationFailed("denied".into()).kind()),
            exit_code(SshError::TransportUnreachable("refused".into()).kind()),
            exit_code(bind.kind()),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 6]);
    }
}
