//! Port Forwarding Module
//!
//! Local listeners, per-connection forwarders and the registry that tracks
//! them. Every tunnel shares one authenticated gateway session.

mod forwarder;
mod listener;
mod registry;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use forwarder::{forward_connection, ForwarderContext};
pub(crate) use forwarder::signalled;
pub use listener::{AcceptContext, AcceptOptions, TunnelListenerSet};
pub use registry::{ConnectionGuard, ConnectionRegistry, ForwardStats, SharedStats};
pub use traits::{Establish, ForwardSession, ForwardStream, ForwardStreamIo};
