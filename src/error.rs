//! Error types and error handling strategy for the pooled reactor.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Failures that concern a single peer never escape the reactor or the
//!   accept loop; they are logged and the offending connection is closed
//! - Errors are classified by recoverability so protocol layers can decide
//!   between closing a connection and retrying an operation
//!
//! # Error Categories
//!
//! - **Ports**: the port allocator ran out of configured ranges
//! - **Plugins**: a named socket provider or upgrader is not registered
//! - **Timeouts**: a bounded `send`/`retrieve_data` call expired
//! - **Data**: the peer sent nothing where data was expected
//! - **Pool**: the work pool rejected or lost a unit of work
//! - **Config**: service parameters failed to parse or validate
//! - **Io**: any other socket-level failure
//! - **Internal**: invalid state transitions and bugs

use core::fmt;
use std::io;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Ports ===
    /// Every configured port range is exhausted.
    PortStarvation,

    // === Plugins ===
    /// No socket provider is registered under the requested name.
    SocketProviderNotFound,
    /// No socket upgrader is registered under the requested name.
    SocketUpgraderNotFound,

    // === Timeouts ===
    /// Server side: the peer did not deliver a request in time.
    RequestTimeout,
    /// Server side: the response could not be flushed in time.
    ResponseTimeout,
    /// Client side: the request could not be flushed in time.
    ClientRequestTimeout,
    /// Client side: the peer did not deliver a response in time.
    ClientResponseTimeout,

    // === Data ===
    /// A read returned no bytes where data was expected (peer disconnect).
    InvalidData,
    /// The connection has already been closed.
    ConnectionClosed,

    // === Pool ===
    /// Every worker already carries its maximum amount of work.
    PoolSaturated,
    /// The pool is not running.
    PoolStopped,

    // === Config ===
    /// Invalid or unparseable configuration.
    Config,

    // === Io ===
    /// Socket-level I/O failure.
    Io,

    // === Internal / state machine ===
    /// Invalid state transition.
    InvalidStateTransition,
    /// Internal error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::PortStarvation => ErrorCategory::Ports,
            Self::SocketProviderNotFound | Self::SocketUpgraderNotFound => ErrorCategory::Plugin,
            Self::RequestTimeout
            | Self::ResponseTimeout
            | Self::ClientRequestTimeout
            | Self::ClientResponseTimeout => ErrorCategory::Timeout,
            Self::InvalidData | Self::ConnectionClosed => ErrorCategory::Data,
            Self::PoolSaturated | Self::PoolStopped => ErrorCategory::Pool,
            Self::Config => ErrorCategory::Config,
            Self::Io => ErrorCategory::Io,
            Self::InvalidStateTransition | Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::PoolSaturated
            | Self::RequestTimeout
            | Self::ResponseTimeout
            | Self::ClientRequestTimeout
            | Self::ClientResponseTimeout => Recoverability::Transient,

            Self::PortStarvation
            | Self::SocketProviderNotFound
            | Self::SocketUpgraderNotFound
            | Self::InvalidData
            | Self::ConnectionClosed
            | Self::PoolStopped
            | Self::Config
            | Self::InvalidStateTransition
            | Self::Internal => Recoverability::Permanent,

            Self::Io => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }
}

/// Classification of error recoverability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context.
    Unknown,
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Port allocation failures.
    Ports,
    /// Socket provider / upgrader lookup failures.
    Plugin,
    /// Bounded I/O expired.
    Timeout,
    /// Missing or unexpected data from the peer.
    Data,
    /// Work pool failures.
    Pool,
    /// Configuration failures.
    Config,
    /// Socket-level failures.
    Io,
    /// Internal errors.
    Internal,
}

/// The main error type for reactor, service and connection operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns true if this error is a bounded-I/O timeout of either direction.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind.category(), ErrorCategory::Timeout)
    }

    /// Creates a port starvation error.
    #[must_use]
    pub fn port_starvation(ranges: usize) -> Self {
        Self::new(ErrorKind::PortStarvation)
            .with_message(format!("all {ranges} configured port ranges are exhausted"))
    }

    /// Creates a socket-provider-not-found error.
    #[must_use]
    pub fn provider_not_found(name: &str) -> Self {
        Self::new(ErrorKind::SocketProviderNotFound)
            .with_message(format!("no socket provider named {name:?}"))
    }

    /// Creates a socket-upgrader-not-found error.
    #[must_use]
    pub fn upgrader_not_found(name: &str) -> Self {
        Self::new(ErrorKind::SocketUpgraderNotFound)
            .with_message(format!("no socket upgrader named {name:?}"))
    }

    /// Creates an invalid-data error for an empty read.
    #[must_use]
    pub fn invalid_data() -> Self {
        Self::new(ErrorKind::InvalidData).with_message("peer returned no data")
    }

    /// Creates an invalid state transition error.
    #[must_use]
    pub fn invalid_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(ErrorKind::InvalidStateTransition)
            .with_message(format!("cannot move from {from:?} to {to:?}"))
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }

    /// Creates an internal error (bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        Self::new(ErrorKind::Io)
            .with_message(message)
            .with_source(err)
    }
}

/// A specialized `Result` type for reactor operations.
pub type Result<T> = std::result::Result<T, Error>;
