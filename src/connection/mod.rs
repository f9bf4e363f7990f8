//! Per-socket connection state.
//!
//! A [`Connection`] owns one transport and everything a protocol handler
//! needs around it: addresses, a cancellation deadline, a typed property bag
//! and open/close observers. Connections live inside exactly one reactor and
//! are only touched from that reactor's thread, so nothing here is locked.
//!
//! # Bounded I/O
//!
//! The socket stays non-blocking while the reactor owns it. [`send`] and
//! [`retrieve_data`] switch it to blocking mode with a kernel timeout for the
//! duration of the call and switch it back afterwards, whatever the outcome.
//! Expiry is reported with a direction-specific timeout error:
//!
//! | Role | `send` | `retrieve_data` |
//! |------|--------|-----------------|
//! | server | `ResponseTimeout` | `RequestTimeout` |
//! | client | `ClientRequestTimeout` | `ClientResponseTimeout` |
//!
//! A timed-out connection is still usable for an explicit close.
//!
//! [`send`]: Connection::send
//! [`retrieve_data`]: Connection::retrieve_data

pub mod datagram;
pub mod properties;

pub use datagram::Datagram;
pub use properties::Properties;

use crate::config::ServiceConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::net::{SocketParameters, SocketRegistry, Transport};
use crate::tracing_compat::{debug, trace};
use std::any::Any;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a unit of work.
///
/// `id` is unique for the life of the process. Raw descriptors are reused
/// after close; ids are not, so a stale key never matches a newer socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey {
    /// Process-unique source id.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    /// Local port the work arrived on.
    pub port: u16,
}

impl WorkKey {
    /// Allocates a key with a fresh source id.
    #[must_use]
    pub fn next(peer: SocketAddr, port: u16) -> Self {
        Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            port,
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}->:{}", self.id, self.peer, self.port)
    }
}

/// Which end of the conversation this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepted by a service.
    Server,
    /// Opened with [`Connection::connect`].
    Client,
}

impl Role {
    const fn send_timeout(self) -> ErrorKind {
        match self {
            Self::Server => ErrorKind::ResponseTimeout,
            Self::Client => ErrorKind::ClientRequestTimeout,
        }
    }

    const fn retrieve_timeout(self) -> ErrorKind {
        match self {
            Self::Server => ErrorKind::RequestTimeout,
            Self::Client => ErrorKind::ClientResponseTimeout,
        }
    }
}

/// I/O settings of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Bound on reading a request (server) or sending one (client).
    pub request_timeout: Duration,
    /// Bound on sending a response (server) or reading one (client).
    pub response_timeout: Duration,
}

impl ConnectionOptions {
    /// Extracts the connection settings of a service.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            request_timeout: config.timeouts.request,
            response_timeout: config.timeouts.response,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

/// Settings for [`Connection::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound on establishing the connection; zero waits for the OS.
    pub connect_timeout: Duration,
    /// I/O settings of the resulting connection.
    pub io: ConnectionOptions,
    /// Upgraders available to [`Connection::upgrade`].
    pub registry: Arc<SocketRegistry>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io: ConnectionOptions::default(),
            registry: Arc::new(SocketRegistry::new()),
        }
    }
}

/// Callback run when a connection opens or closes.
pub type Observer = Box<dyn FnMut(&Connection) + Send>;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// One socket plus the state a protocol handler keeps about it.
pub struct Connection {
    key: WorkKey,
    transport: Option<Box<dyn Transport>>,
    local: Option<SocketAddr>,
    role: Role,
    options: ConnectionOptions,
    deadline: Option<Instant>,
    properties: Properties,
    on_open: Vec<Observer>,
    on_close: Vec<Observer>,
    open: bool,
    registry: Arc<SocketRegistry>,
}

impl Connection {
    /// Wraps an accepted socket. The connection is not yet open.
    #[must_use]
    pub fn new(
        key: WorkKey,
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
        registry: Arc<SocketRegistry>,
    ) -> Self {
        Self::with_role(key, transport, options, registry, Role::Server)
    }

    fn with_role(
        key: WorkKey,
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
        registry: Arc<SocketRegistry>,
        role: Role,
    ) -> Self {
        let local = transport.local_addr().ok();
        Self {
            key,
            transport: Some(transport),
            local,
            role,
            options,
            deadline: None,
            properties: Properties::new(),
            on_open: Vec::new(),
            on_close: Vec::new(),
            open: false,
            registry,
        }
    }

    /// Opens a client connection to `addr`.
    ///
    /// The socket is left non-blocking like an accepted one, and the
    /// connection is returned open.
    ///
    /// # Errors
    ///
    /// `Io` if the connection cannot be established in time.
    pub fn connect(addr: SocketAddr, options: ConnectOptions) -> Result<Self> {
        let stream = if options.connect_timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, options.connect_timeout)
        }
        .map_err(|err| {
            let timed_out = err.kind() == io::ErrorKind::TimedOut;
            let error = Error::from(err);
            if timed_out {
                error.with_message(format!("connect to {addr} timed out"))
            } else {
                error
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let port = stream.local_addr()?.port();
        let mut connection = Self::with_role(
            WorkKey::next(addr, port),
            Box::new(stream),
            options.io,
            options.registry,
            Role::Client,
        );
        connection.open();
        debug!(peer = %addr, key = %connection.key, "client connection opened");
        Ok(connection)
    }

    /// Identity of this connection.
    #[must_use]
    pub const fn key(&self) -> WorkKey {
        self.key
    }

    /// Remote address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.key.peer
    }

    /// Local address, if the OS reported one.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Local port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.key.port
    }

    /// Server or client side.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// I/O settings.
    #[must_use]
    pub const fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Maximum bytes per read.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.options.chunk_size
    }

    /// Returns `true` between [`open`](Self::open) and [`close`](Self::close).
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Descriptor of the current transport; `None` once closed.
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(|t| t.raw_fd())
    }

    /// Current transport.
    #[must_use]
    pub fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }

    /// Current transport, mutably, for handlers doing their own I/O.
    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Registers a callback for [`open`](Self::open).
    pub fn on_open(&mut self, observer: impl FnMut(&Self) + Send + 'static) {
        self.on_open.push(Box::new(observer));
    }

    /// Registers a callback for [`close`](Self::close).
    pub fn on_close(&mut self, observer: impl FnMut(&Self) + Send + 'static) {
        self.on_close.push(Box::new(observer));
    }

    /// Marks the connection open and runs the open observers.
    pub fn open(&mut self) {
        self.open = true;
        let mut observers = std::mem::take(&mut self.on_open);
        for observer in &mut observers {
            observer(self);
        }
        observers.append(&mut self.on_open);
        self.on_open = observers;
    }

    /// Shuts down and releases the transport, marks the connection closed
    /// and runs the close observers.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; shutdown failures are logged.
    pub fn close(&mut self) -> Result<()> {
        let Some(transport) = self.transport.take() else {
            self.open = false;
            return Ok(());
        };
        if let Err(err) = transport.shutdown() {
            trace!(key = %self.key, error = %err, "shutdown on close failed");
        }
        drop(transport);
        self.open = false;
        self.deadline = None;
        let mut observers = std::mem::take(&mut self.on_close);
        for observer in &mut observers {
            observer(self);
        }
        observers.append(&mut self.on_close);
        self.on_close = observers;
        debug!(key = %self.key, "connection closed");
        Ok(())
    }

    /// Arms the cancellation deadline `delta` from now.
    ///
    /// `Duration::ZERO` clears the deadline.
    pub fn cancel(&mut self, delta: Duration) {
        self.deadline = if delta.is_zero() {
            None
        } else {
            Instant::now().checked_add(delta)
        };
    }

    /// Current deadline; `None` means never.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` if the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Replaces the transport with the one produced by the upgrader `name`.
    ///
    /// The owning reactor notices the new descriptor and re-registers it
    /// under the same token.
    ///
    /// # Errors
    ///
    /// - `SocketUpgraderNotFound` if no upgrader has that name; the
    ///   connection is unchanged
    /// - `ConnectionClosed` if the connection has no transport
    /// - `Io` if the upgrade fails; the transport is lost and the
    ///   connection must be closed
    pub fn upgrade(&mut self, name: &str, params: &SocketParameters) -> Result<()> {
        let upgrader = self.registry.upgrader(name)?;
        let transport = self.transport.take().ok_or_else(Self::closed_error)?;
        let upgraded = upgrader.upgrade_socket(transport, params).map_err(|err| {
            Error::from(err).with_message(format!("upgrade {name:?} failed"))
        })?;
        upgraded.set_nonblocking(true)?;
        debug!(key = %self.key, upgrader = name, fd = upgraded.raw_fd(), "transport upgraded");
        self.transport = Some(upgraded);
        Ok(())
    }

    /// Writes all of `message`, bounding each blocking write by `timeout`.
    ///
    /// # Errors
    ///
    /// The role's send timeout kind on expiry, `ConnectionClosed` without a
    /// transport, `Io` otherwise.
    pub fn send(&mut self, message: &[u8], timeout: Duration) -> Result<()> {
        let kind = self.role.send_timeout();
        let transport = self.transport.as_deref_mut().ok_or_else(Self::closed_error)?;
        enter_blocking(transport, Direction::Write, timeout)?;
        let result = write_all_bounded(transport, message, kind);
        let restored = transport.set_nonblocking(true);
        result?;
        restored?;
        trace!(key = %self.key, bytes = message.len(), "sent");
        Ok(())
    }

    /// Reads at most `chunk_size` bytes, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// The role's retrieve timeout kind on expiry, `InvalidData` if the peer
    /// sent nothing (closed), `ConnectionClosed` without a transport.
    pub fn retrieve_data(&mut self, timeout: Duration, chunk_size: usize) -> Result<Vec<u8>> {
        let kind = self.role.retrieve_timeout();
        let transport = self.transport.as_deref_mut().ok_or_else(Self::closed_error)?;
        enter_blocking(transport, Direction::Read, timeout)?;
        let result = read_bounded(transport, chunk_size.max(1), kind);
        let restored = transport.set_nonblocking(true);
        let data = result?;
        restored?;
        trace!(key = %self.key, bytes = data.len(), "retrieved");
        Ok(data)
    }

    /// [`send`](Self::send) with the configured timeout for this role.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_default(&mut self, message: &[u8]) -> Result<()> {
        let timeout = match self.role {
            Role::Server => self.options.response_timeout,
            Role::Client => self.options.request_timeout,
        };
        self.send(message, timeout)
    }

    /// [`retrieve_data`](Self::retrieve_data) with the configured timeout
    /// and chunk size.
    ///
    /// # Errors
    ///
    /// As [`retrieve_data`](Self::retrieve_data).
    pub fn retrieve(&mut self) -> Result<Vec<u8>> {
        let timeout = match self.role {
            Role::Server => self.options.request_timeout,
            Role::Client => self.options.response_timeout,
        };
        self.retrieve_data(timeout, self.options.chunk_size)
    }

    /// Typed property lookup.
    #[must_use]
    pub fn property<T: Any>(&self, name: &str) -> Option<&T> {
        self.properties.get(name)
    }

    /// Mutable typed property lookup.
    pub fn property_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.properties.get_mut(name)
    }

    /// Stores a property. Returns `true` if it replaced one.
    pub fn set_property<T: Any + Send>(&mut self, name: impl Into<String>, value: T) -> bool {
        self.properties.set(name, value)
    }

    /// Removes a property. Returns `true` if it existed.
    pub fn unset_property(&mut self, name: &str) -> bool {
        self.properties.unset(name)
    }

    /// Returns `true` if a property named `name` exists.
    #[must_use]
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(name)
    }

    /// The whole property bag.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Peeks one byte to tell readable data from an orderly peer close.
    ///
    /// `Ok(true)` means the peer closed. Decoded input buffered by an
    /// upgraded transport counts as data.
    pub(crate) fn peer_closed(&self) -> io::Result<bool> {
        let transport = self
            .transport
            .as_deref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if transport.buffered_input() > 0 {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        loop {
            match transport.peek(&mut byte) {
                Ok(n) => return Ok(n == 0),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns `true` if the transport holds decoded input the poller cannot see.
    pub(crate) fn has_buffered_input(&self) -> bool {
        self.transport
            .as_deref()
            .is_some_and(|t| t.buffered_input() > 0)
    }

    fn closed_error() -> Error {
        Error::new(ErrorKind::ConnectionClosed).with_message("connection has no transport")
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("open", &self.open)
            .field("fd", &self.raw_fd())
            .field("deadline", &self.deadline)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn timeout_error(kind: ErrorKind, direction: Direction) -> Error {
    Error::new(kind).with_message(match direction {
        Direction::Read => "read timed out",
        Direction::Write => "write timed out",
    })
}

/// A zero timeout keeps the socket non-blocking: one attempt, no wait.
fn enter_blocking(
    transport: &mut dyn Transport,
    direction: Direction,
    timeout: Duration,
) -> io::Result<()> {
    if timeout.is_zero() {
        return Ok(());
    }
    transport.set_nonblocking(false)?;
    match direction {
        Direction::Read => transport.set_read_timeout(Some(timeout)),
        Direction::Write => transport.set_write_timeout(Some(timeout)),
    }
}

fn write_all_bounded(transport: &mut dyn Transport, mut buf: &[u8], kind: ErrorKind) -> Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if is_timeout(&err) => return Err(timeout_error(kind, Direction::Write)),
            Err(err) => return Err(err.into()),
        }
    }
    loop {
        match transport.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if is_timeout(&err) => return Err(timeout_error(kind, Direction::Write)),
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_bounded(transport: &mut dyn Transport, chunk_size: usize, kind: ErrorKind) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match transport.read(&mut buf) {
            Ok(0) => return Err(Error::invalid_data()),
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if is_timeout(&err) => return Err(timeout_error(kind, Direction::Read)),
            Err(err) => return Err(err.into()),
        }
    }
}
