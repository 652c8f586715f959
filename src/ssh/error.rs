//! SSH Error types

use thiserror::Error;

/// Why a local listener could not be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFailureReason {
    AddrInUse,
    PermissionDenied,
    AddrNotAvailable,
    Other,
}

impl BindFailureReason {
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddrInUse,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AddrNotAvailable => Self::AddrNotAvailable,
            _ => Self::Other,
        }
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Host key unresolved: {0}")]
    HostKeyUnresolved(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Gateway unreachable: {0}")]
    TransportUnreachable(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Failed to bind tunnel listener {addr}: {message}")]
    TunnelBindFailed {
        addr: String,
        reason: BindFailureReason,
        message: String,
    },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Disconnected")]
    Disconnected,
}

/// Flat error category, for callers that branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    HostKeyUnresolved,
    AuthenticationFailed,
    TransportUnreachable,
    TransportFailure,
    ListenerBindFailure,
    PerConnectionFailure,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Configuration(_) => ErrorKind::Configuration,
            SshError::HostKeyUnresolved(_) => ErrorKind::HostKeyUnresolved,
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => {
                ErrorKind::AuthenticationFailed
            }
            SshError::TransportUnreachable(_) => ErrorKind::TransportUnreachable,
            SshError::TransportFailure(_) | SshError::Disconnected => ErrorKind::TransportFailure,
            SshError::TunnelBindFailed { .. } => ErrorKind::ListenerBindFailure,
            SshError::ChannelError(_)
            | SshError::Timeout(_)
            | SshError::IoError(_)
            | SshError::ProtocolError(_) => ErrorKind::PerConnectionFailure,
        }
    }

    /// Build a bind failure with an operator-facing explanation
    pub fn bind_failed(addr: impl Into<String>, err: &std::io::Error) -> Self {
        let addr = addr.into();
        let reason = BindFailureReason::from_io(err);
        let message = match reason {
            BindFailureReason::AddrInUse => {
                "port already in use, another application may be using this port".to_string()
            }
            BindFailureReason::PermissionDenied => {
                "permission denied, ports below 1024 require elevated privileges".to_string()
            }
            BindFailureReason::AddrNotAvailable => {
                "address not available, the specified address is not valid on this system"
                    .to_string()
            }
            BindFailureReason::Other => err.to_string(),
        };
        SshError::TunnelBindFailed {
            addr,
            reason,
            message,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failure_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = SshError::bind_failed("127.0.0.1:18080", &io);
        assert_eq!(err.kind(), ErrorKind::ListenerBindFailure);
        match err {
            SshError::TunnelBindFailed { reason, addr, .. } => {
                assert_eq!(reason, BindFailureReason::AddrInUse);
                assert_eq!(addr, "127.0.0.1:18080");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_startup_kinds_are_distinct() {
        let auth = SshError::AuthenticationFailed("rejected".into()).kind();
        let unreachable = SshError::TransportUnreachable("refused".into()).kind();
        let config = SshError::Configuration("bad spec".into()).kind();
        assert_ne!(auth, unreachable);
        assert_ne!(auth, config);
        assert_ne!(unreachable, config);
        assert_eq!(
            SshError::ChannelError("reset".into()).kind(),
            ErrorKind::PerConnectionFailure
        );
    }
}
