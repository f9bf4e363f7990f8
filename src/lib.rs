//! Pooled connection reactor: per-thread event loops behind a work pool.
//!
//! # Overview
//!
//! A [`Service`] binds one socket and runs one loop thread that accepts
//! connections (or receives datagrams) and inserts each into a
//! [`WorkPool`]. Every pool worker hosts one long-lived reactor task that
//! owns its connections, polls them through a private [`Poller`], enforces
//! idle deadlines, and calls the user's handler on readable input.
//!
//! # Core Guarantees
//!
//! - **Single owner**: a connection lives on exactly one reactor; all of its
//!   I/O happens on that reactor's thread
//! - **Close once**: `handle_closed` runs exactly once per connection, on
//!   whichever of expiry, peer close, handler decision or shutdown comes first
//! - **Bounded waits**: every poll, read, write and accept wait is bounded,
//!   so `stop()` always completes
//! - **Contained failures**: handler errors and panics close one connection
//!   and never stop a reactor
//!
//! # Module Structure
//!
//! - [`port`]: process-wide port allocation from configured ranges
//! - [`poller`]: readiness multiplexer abstraction, native and lab backends
//! - [`net`]: transports, socket providers and upgraders
//! - [`connection`]: the per-client [`Connection`] and connectionless [`Datagram`]
//! - [`handler`]: user callbacks
//! - [`pool`]: work pools hosting long-lived tasks
//! - [`reactor`]: the pool tasks driving connections and datagrams
//! - [`server`]: [`Service`] and [`DatagramService`]
//! - [`config`]: service parameters, defaults and environment overrides
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![cfg(unix)]

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod net;
pub mod poller;
pub mod pool;
pub mod port;
pub mod reactor;
pub mod server;
pub mod tracing_compat;

#[cfg(test)]
pub mod test_utils;

pub use config::{ConfigError, ServiceConfig, ServiceParameters, TransportKind};
pub use connection::{Connection, Datagram, WorkKey};
pub use error::{Error, ErrorCategory, ErrorKind, Recoverability, Result};
pub use handler::{ClientServiceHandler, DatagramHandler, Disposition, FnHandler};
pub use net::{SocketProvider, SocketRegistry, SocketUpgrader, Transport};
pub use poller::{Poller, PollerFactory};
pub use pool::{WorkPool, WorkPoolFactory};
pub use port::PortAllocator;
pub use reactor::{ConnectionReactor, DatagramReactor};
pub use server::{DatagramService, Service, ServiceState, ServiceStats};
