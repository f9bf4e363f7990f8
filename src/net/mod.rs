//! Socket plumbing shared by services and connections.
//!
//! - [`Transport`]: the byte stream a [`Connection`](crate::connection::Connection)
//!   owns. Plain `TcpStream`s implement it; upgraders may wrap it.
//! - [`SocketProvider`]: creates the socket a service binds to.
//! - [`SocketUpgrader`]: wraps an accepted transport (e.g. a TLS session).
//! - [`SocketRegistry`]: named providers and upgraders, injected into
//!   services instead of living in process-global state.

pub mod provider;
pub mod transport;

pub use provider::{RawSocketProvider, SocketProvider, SocketRegistry, SocketUpgrader};
pub use transport::Transport;

use std::collections::BTreeMap;

/// Opaque string settings forwarded to providers and upgraders.
pub type SocketParameters = BTreeMap<String, String>;
