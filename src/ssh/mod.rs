//! SSH module - gateway host keys, authentication and the shared session
//!
//! This module provides the SSH side of the tunnel engine using the russh
//! library.
//!
//! # Features
//! - Host key resolution via an append-only known_hosts store, an
//!   operator-supplied key file, or interactive trust on first use
//! - Single-method authentication (public key or password)
//! - One multiplexed session shared by every forwarder

mod auth;
mod client;
mod error;
pub mod host_key;
pub mod known_hosts;
pub mod preflight;
mod session;

pub use auth::{AuthMethod, Authenticator, GatewayCredentials};
pub use client::{ClientHandler, HostKeyPolicy, SessionEstablisher};
pub use error::{BindFailureReason, ErrorKind, SshError};
pub use host_key::{
    HostKeyFetcher, HostKeyResolver, HostKeySource, ResolvedHostKey, TrustPolicy, TrustPrompt,
};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use preflight::fetch_host_key;
pub use session::GatewaySession;
