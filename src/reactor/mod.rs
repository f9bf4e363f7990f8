//! Per-worker event loops.
//!
//! A [`ConnectionReactor`] is the pool task of a connection service. It owns
//! every connection the pool assigns to it, a private [`Poller`], and the
//! lookup maps between poller tokens and work keys. All connection I/O
//! happens on the reactor's worker thread.
//!
//! # Tick
//!
//! Each [`process`](PoolTask::process) call runs one tick:
//!
//! 1. **Sweep**: connections whose deadline has passed are removed as if the
//!    peer had dropped them.
//! 2. **Poll**: wait for readiness, bounded by the poll timeout and the
//!    nearest deadline. A wake ends the wait early and is never an event.
//!    After a sweep that removed anything the poll does not block.
//! 3. **Dispatch**: each ready connection is peeked; an orderly peer close is
//!    removed without a request, otherwise the handler runs. `KeepOpen`
//!    re-arms the deadline and the one-shot registration; anything else
//!    removes the connection.
//!
//! # Removal
//!
//! Expiry, peer close, a close decision, a pool-initiated removal and
//! reactor stop all go through one removal path: deregister, run
//! `handle_closed`, close the socket, purge both maps. The path runs at most
//! once per connection because the first run takes the connection out of
//! the map.
//!
//! ```text
//! Idle ─start()─▶ Started ─process()─▶ Running ─stop()─▶ Stopped
//! ```

pub mod datagram;

pub use datagram::DatagramReactor;

use crate::config::ServiceConfig;
use crate::connection::{Connection, ConnectionOptions, WorkKey};
use crate::error::{Error, Result};
use crate::handler::{contained, dispatch_request, ClientServiceHandler, Disposition};
use crate::net::{SocketParameters, SocketRegistry, Transport};
use crate::poller::{Events, Interest, Poller, PollerFactory, Token};
use crate::pool::{PoolTask, PoolWork, Wake, WakeHandle};
use crate::tracing_compat::{debug, info, trace, warn};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_EVENTS_CAPACITY: usize = 256;

/// Lifecycle of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactorState {
    /// Constructed, no poller yet.
    Idle,
    /// Poller created and wake handle published.
    Started,
    /// At least one tick has run.
    Running,
    /// Connections closed and poller released.
    Stopped,
}

/// An accepted socket on its way to a reactor.
#[derive(Debug)]
pub struct WorkItem {
    key: WorkKey,
    stream: TcpStream,
}

impl WorkItem {
    /// Wraps an accepted socket with a fresh key.
    ///
    /// # Errors
    ///
    /// `Io` if the socket has no local address.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        let port = stream.local_addr()?.port();
        Ok(Self {
            key: WorkKey::next(peer, port),
            stream,
        })
    }

    /// The socket.
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl PoolWork for WorkItem {
    type Key = WorkKey;

    fn key(&self) -> WorkKey {
        self.key
    }
}

/// Settings shared by every reactor of a service.
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Upper bound on a single poll.
    pub poll_timeout: Duration,
    /// Idle deadline armed on open and after every kept-open request;
    /// zero disables it.
    pub connection_timeout: Duration,
    /// Settings handed to each connection.
    pub connection: ConnectionOptions,
    /// Upgrader applied to every accepted connection.
    pub upgrader: Option<String>,
    /// Parameters for the upgrader.
    pub socket_parameters: SocketParameters,
    /// Readiness events handled per tick.
    pub events_capacity: usize,
}

impl ReactorOptions {
    /// Derives reactor settings from a service configuration.
    ///
    /// The configured socket provider name doubles as the upgrader name
    /// when `registry` has an upgrader under it.
    #[must_use]
    pub fn from_config(config: &ServiceConfig, registry: &SocketRegistry) -> Self {
        Self {
            poll_timeout: config.timeouts.poll,
            connection_timeout: config.timeouts.connection,
            connection: ConnectionOptions::from_config(config),
            upgrader: config
                .socket_provider
                .clone()
                .filter(|name| registry.has_upgrader(name)),
            socket_parameters: config.socket_parameters.clone(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default(), &SocketRegistry::new())
    }
}

struct PollerWake(Arc<dyn Poller>);

impl Wake for PollerWake {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

struct Entry {
    connection: Connection,
    fd: RawFd,
}

/// Event loop owning the connections of one pool worker.
pub struct ConnectionReactor<H: ClientServiceHandler> {
    id: usize,
    handler: Arc<H>,
    registry: Arc<SocketRegistry>,
    poller_factory: Arc<dyn PollerFactory>,
    options: ReactorOptions,
    state: ReactorState,
    poller: Option<Arc<dyn Poller>>,
    waker: WakeHandle,
    events: Events,
    connections: HashMap<Token, Entry>,
    tokens: HashMap<WorkKey, Token>,
    redispatch: Vec<Token>,
    rejected: Vec<WorkKey>,
    next_token: usize,
}

impl<H: ClientServiceHandler> ConnectionReactor<H> {
    /// Creates an idle reactor.
    #[must_use]
    pub fn new(
        id: usize,
        handler: Arc<H>,
        registry: Arc<SocketRegistry>,
        poller_factory: Arc<dyn PollerFactory>,
        options: ReactorOptions,
    ) -> Self {
        let events = Events::with_capacity(options.events_capacity.max(1));
        Self {
            id,
            handler,
            registry,
            poller_factory,
            options,
            state: ReactorState::Idle,
            poller: None,
            waker: WakeHandle::new(),
            events,
            connections: HashMap::new(),
            tokens: HashMap::new(),
            redispatch: Vec::new(),
            rejected: Vec::new(),
            next_token: 1,
        }
    }

    /// Worker index this reactor runs on.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ReactorState {
        self.state
    }

    /// Number of connections owned.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if the connection with `key` is owned by this reactor.
    #[must_use]
    pub fn contains(&self, key: &WorkKey) -> bool {
        self.tokens.contains_key(key)
    }

    /// Poller token of the connection with `key`.
    #[must_use]
    pub fn token_of(&self, key: &WorkKey) -> Option<Token> {
        self.tokens.get(key).copied()
    }

    /// The connection with `key`.
    #[must_use]
    pub fn connection(&self, key: &WorkKey) -> Option<&Connection> {
        let token = self.tokens.get(key)?;
        self.connections.get(token).map(|entry| &entry.connection)
    }

    /// The private poller, while started.
    #[must_use]
    pub fn poller(&self) -> Option<&Arc<dyn Poller>> {
        self.poller.as_ref()
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token::new(self.next_token);
            self.next_token = self.next_token.wrapping_add(1).max(1);
            if !self.connections.contains_key(&token) {
                return token;
            }
        }
    }

    /// Registers an accepted socket and runs the open callbacks.
    fn admit(&mut self, item: WorkItem, poller: &Arc<dyn Poller>) -> Result<Token> {
        let WorkItem { key, stream } = item;
        stream.set_nonblocking(true)?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(key = %key, error = %err, "TCP_NODELAY not set");
        }
        let transport: Box<dyn Transport> = Box::new(stream);
        let mut connection = Connection::new(
            key,
            transport,
            self.options.connection,
            Arc::clone(&self.registry),
        );
        if let Some(name) = &self.options.upgrader {
            connection.upgrade(name, &self.options.socket_parameters)?;
        }
        let fd = connection
            .raw_fd()
            .ok_or_else(|| Error::internal("admitted connection has no transport"))?;
        let token = self.allocate_token();
        poller.register(fd, token, Interest::READABLE)?;
        connection.open();
        self.connections.insert(token, Entry { connection, fd });
        self.tokens.insert(key, token);
        Ok(token)
    }

    /// Nearest deadline bounds the poll so expiry is never late by more
    /// than one tick.
    fn poll_timeout(&self, now: Instant) -> Duration {
        self.connections
            .values()
            .filter_map(|entry| entry.connection.deadline())
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.options.poll_timeout, Duration::min)
    }

    fn sweep(&mut self, now: Instant, removed: &mut Vec<WorkKey>) {
        let mut expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.connection.is_expired(now))
            .map(|(token, _)| *token)
            .collect();
        expired.sort_unstable();
        for token in expired {
            debug!(reactor = self.id, token = token.0, "connection deadline passed");
            if let Some(key) = self.release(token) {
                removed.push(key);
            }
        }
    }

    fn dispatch(&mut self, token: Token, removed: &mut Vec<WorkKey>) {
        let Some(entry) = self.connections.get_mut(&token) else {
            return;
        };
        match entry.connection.peer_closed() {
            Ok(false) => {}
            Ok(true) => {
                debug!(reactor = self.id, key = %entry.connection.key(), "peer closed");
                if let Some(key) = self.release(token) {
                    removed.push(key);
                }
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!(reactor = self.id, token = token.0, "spurious readiness");
                self.rearm(token, removed);
                return;
            }
            Err(err) => {
                debug!(reactor = self.id, error = %err, "peek failed");
                if let Some(key) = self.release(token) {
                    removed.push(key);
                }
                return;
            }
        }

        let disposition = dispatch_request(&*self.handler, &mut entry.connection);
        let still_open = entry.connection.raw_fd().is_some();
        match disposition {
            Disposition::KeepOpen if still_open => {
                entry.connection.cancel(self.options.connection_timeout);
                self.rearm(token, removed);
            }
            _ => {
                if let Some(key) = self.release(token) {
                    removed.push(key);
                }
            }
        }
    }

    /// Re-arms the one-shot registration, re-registering if the transport
    /// was replaced by an upgrade.
    fn rearm(&mut self, token: Token, removed: &mut Vec<WorkKey>) {
        let Some(poller) = self.poller.clone() else {
            return;
        };
        let Some(entry) = self.connections.get_mut(&token) else {
            return;
        };
        let result = match entry.connection.raw_fd() {
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            Some(fd) if fd == entry.fd => poller.modify(token, Interest::READABLE),
            Some(fd) => {
                if let Err(err) = poller.deregister(token) {
                    trace!(token = token.0, error = %err, "stale registration");
                }
                let registered = poller.register(fd, token, Interest::READABLE);
                if registered.is_ok() {
                    debug!(reactor = self.id, token = token.0, fd, "transport re-registered");
                    entry.fd = fd;
                }
                registered
            }
        };
        let buffered = entry.connection.has_buffered_input();
        match result {
            Ok(()) if buffered => self.redispatch.push(token),
            Ok(()) => {}
            Err(err) => {
                warn!(reactor = self.id, token = token.0, error = %err, "re-arm failed, closing");
                if let Some(key) = self.release(token) {
                    removed.push(key);
                }
            }
        }
    }

    /// The single removal path. Returns the key if the token was owned.
    fn release(&mut self, token: Token) -> Option<WorkKey> {
        let mut entry = self.connections.remove(&token)?;
        let key = entry.connection.key();
        self.tokens.remove(&key);
        self.redispatch.retain(|t| *t != token);
        if let Some(poller) = &self.poller {
            if let Err(err) = poller.deregister(token) {
                trace!(token = token.0, error = %err, "deregister on removal");
            }
        }
        let handler = Arc::clone(&self.handler);
        contained("handle_closed", || handler.handle_closed(&mut entry.connection));
        if let Err(err) = entry.connection.close() {
            debug!(key = %key, error = %err, "close failed");
        }
        debug!(reactor = self.id, key = %key, "connection removed");
        Some(key)
    }
}

impl<H: ClientServiceHandler> PoolTask for ConnectionReactor<H> {
    type Work = WorkItem;

    fn start(&mut self) -> Result<()> {
        if self.state != ReactorState::Idle {
            return Err(Error::invalid_transition(self.state, ReactorState::Started));
        }
        let poller = self.poller_factory.create()?;
        self.waker
            .publish(Arc::new(PollerWake(Arc::clone(&poller))) as Arc<dyn Wake>);
        self.poller = Some(poller);
        self.state = ReactorState::Started;
        info!(reactor = self.id, "reactor started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == ReactorState::Stopped {
            return;
        }
        let mut tokens: Vec<Token> = self.connections.keys().copied().collect();
        tokens.sort_unstable();
        let closed = tokens.len();
        for token in tokens {
            self.release(token);
        }
        self.rejected.clear();
        self.waker.retract();
        self.poller = None;
        self.state = ReactorState::Stopped;
        info!(reactor = self.id, closed, "reactor stopped");
    }

    fn process(&mut self, removed: &mut Vec<WorkKey>) {
        let Some(poller) = self.poller.clone() else {
            return;
        };
        if self.state == ReactorState::Started {
            self.state = ReactorState::Running;
        }
        removed.append(&mut self.rejected);

        let now = Instant::now();
        let before = removed.len();
        self.sweep(now, removed);

        // Expired keys go back to the pool this tick, not after a full wait.
        let timeout = if self.redispatch.is_empty() && removed.len() == before {
            self.poll_timeout(now)
        } else {
            Duration::ZERO
        };
        if let Err(err) = poller.poll(&mut self.events, Some(timeout)) {
            warn!(reactor = self.id, error = %err, "poll failed");
            self.events.clear();
        }

        let mut ready: Vec<Token> = self.events.iter().map(|event| event.token).collect();
        for token in self.redispatch.drain(..) {
            if !ready.contains(&token) {
                ready.push(token);
            }
        }
        trace!(reactor = self.id, ready = ready.len(), "tick");
        for token in ready {
            self.dispatch(token, removed);
        }
    }

    fn waker(&self) -> WakeHandle {
        self.waker.clone()
    }

    fn work_added(&mut self, item: WorkItem) {
        let key = item.key;
        if self.tokens.contains_key(&key) {
            warn!(reactor = self.id, key = %key, "duplicate work ignored");
            return;
        }
        let Some(poller) = self.poller.clone() else {
            warn!(reactor = self.id, key = %key, "work added to a reactor that is not started");
            self.rejected.push(key);
            return;
        };
        let token = match self.admit(item, &poller) {
            Ok(token) => token,
            Err(err) => {
                warn!(reactor = self.id, key = %key, error = %err, "failed to add connection");
                self.rejected.push(key);
                return;
            }
        };
        debug!(reactor = self.id, key = %key, token = token.0, "connection added");

        let handler = Arc::clone(&self.handler);
        let connection_timeout = self.options.connection_timeout;
        let Some(entry) = self.connections.get_mut(&token) else {
            return;
        };
        let opened = contained("handle_opened", || handler.handle_opened(&mut entry.connection));
        if opened.is_none() {
            if let Some(key) = self.release(token) {
                self.rejected.push(key);
            }
            return;
        }
        entry.connection.cancel(connection_timeout);
        if entry.connection.has_buffered_input() {
            self.redispatch.push(token);
        }
    }

    fn work_removed(&mut self, key: &WorkKey) {
        let Some(token) = self.tokens.get(key).copied() else {
            trace!(reactor = self.id, key = %key, "removal of unknown key ignored");
            return;
        };
        self.release(token);
    }
}

impl<H: ClientServiceHandler> fmt::Debug for ConnectionReactor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionReactor")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::poller::{LabPoller, LabPollerFactory, SystemPollerFactory};
    use crate::test_utils::{init_test_logging, tcp_pair};
    use crate::net::SocketUpgrader;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, WorkKey)>>,
    }

    impl Recorder {
        fn count(&self, what: &str) -> usize {
            self.events.lock().iter().filter(|(e, _)| *e == what).count()
        }
    }

    impl ClientServiceHandler for Recorder {
        fn handle_opened(&self, connection: &mut Connection) {
            self.events.lock().push(("opened", connection.key()));
        }

        fn handle_closed(&self, connection: &mut Connection) {
            self.events.lock().push(("closed", connection.key()));
        }

        fn handle_request(&self, connection: &mut Connection) -> Result<Disposition> {
            self.events.lock().push(("request", connection.key()));
            let data = connection.retrieve()?;
            connection.send_default(&data)?;
            Ok(Disposition::KeepOpen)
        }
    }

    fn reactor_with(
        factory: Arc<dyn PollerFactory>,
        options: ReactorOptions,
    ) -> (ConnectionReactor<Recorder>, Arc<Recorder>) {
        let handler = Arc::new(Recorder::default());
        let reactor = ConnectionReactor::new(
            0,
            Arc::clone(&handler),
            Arc::new(SocketRegistry::new()),
            factory,
            options,
        );
        (reactor, handler)
    }

    fn item() -> (WorkItem, TcpStream) {
        let (server, client, peer) = tcp_pair().expect("pair");
        (WorkItem::new(server, peer).expect("item"), client)
    }

    fn tick_until<H: ClientServiceHandler>(
        reactor: &mut ConnectionReactor<H>,
        removed: &mut Vec<WorkKey>,
        mut done: impl FnMut(&ConnectionReactor<H>, &[WorkKey]) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(reactor, removed) {
            assert!(Instant::now() < deadline, "reactor did not converge");
            reactor.process(removed);
        }
    }

    fn reactor_for<H: ClientServiceHandler>(
        handler: &Arc<H>,
        registry: SocketRegistry,
        options: ReactorOptions,
    ) -> ConnectionReactor<H> {
        ConnectionReactor::new(
            0,
            Arc::clone(handler),
            Arc::new(registry),
            Arc::new(SystemPollerFactory),
            options,
        )
    }

    /// Hands out a pre-made duplicate of the socket, so the upgraded
    /// transport reports readiness on a different descriptor.
    #[derive(Debug)]
    struct DuplicateUpgrader {
        spare: Mutex<Option<TcpStream>>,
    }

    impl SocketUpgrader for DuplicateUpgrader {
        fn upgrade_socket(
            &self,
            transport: Box<dyn Transport>,
            _params: &SocketParameters,
        ) -> io::Result<Box<dyn Transport>> {
            let spare = self
                .spare
                .lock()
                .take()
                .ok_or_else(|| io::Error::other("no spare stream"))?;
            drop(transport);
            Ok(Box::new(spare))
        }
    }

    /// Echoes, upgrading the connection during its first request.
    #[derive(Default)]
    struct UpgradeOnFirstRequest {
        requests: AtomicUsize,
    }

    impl ClientServiceHandler for UpgradeOnFirstRequest {
        fn handle_request(&self, connection: &mut Connection) -> Result<Disposition> {
            let data = connection.retrieve()?;
            if self.requests.fetch_add(1, Ordering::SeqCst) == 0 {
                connection.upgrade("duplicate", &SocketParameters::new())?;
            }
            connection.send_default(&data)?;
            Ok(Disposition::KeepOpen)
        }
    }

    /// Reads ahead from the socket but hands out one byte per read.
    #[derive(Debug)]
    struct Trickle {
        inner: Box<dyn Transport>,
        buffer: VecDeque<u8>,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.buffer.is_empty() {
                let mut chunk = [0u8; 64];
                let n = self.inner.read(&mut chunk)?;
                self.buffer.extend(&chunk[..n]);
            }
            match (self.buffer.pop_front(), buf.first_mut()) {
                (Some(byte), Some(slot)) => {
                    *slot = byte;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Transport for Trickle {
        fn raw_fd(&self) -> RawFd {
            self.inner.raw_fd()
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.inner.peer_addr()
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            self.inner.set_nonblocking(nonblocking)
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.set_read_timeout(timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.set_write_timeout(timeout)
        }

        fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.peek(buf)
        }

        fn shutdown(&self) -> io::Result<()> {
            self.inner.shutdown()
        }

        fn buffered_input(&self) -> usize {
            self.buffer.len()
        }
    }

    #[derive(Debug)]
    struct TrickleUpgrader;

    impl SocketUpgrader for TrickleUpgrader {
        fn upgrade_socket(
            &self,
            transport: Box<dyn Transport>,
            _params: &SocketParameters,
        ) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(Trickle {
                inner: transport,
                buffer: VecDeque::new(),
            }))
        }
    }

    #[derive(Default)]
    struct Chunks {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl ClientServiceHandler for Chunks {
        fn handle_request(&self, connection: &mut Connection) -> Result<Disposition> {
            let data = connection.retrieve()?;
            self.seen.lock().push(data);
            Ok(Disposition::KeepOpen)
        }
    }

    #[test]
    fn lifecycle_states() {
        init_test("lifecycle_states");
        let (mut reactor, _) = reactor_with(Arc::new(SystemPollerFactory), ReactorOptions::default());
        assert_eq!(reactor.state(), ReactorState::Idle);
        assert!(!reactor.waker().is_armed());
        reactor.start().expect("start");
        assert_eq!(reactor.state(), ReactorState::Started);
        assert!(reactor.waker().is_armed());

        let err = reactor.start().expect_err("double start");
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        let mut removed = Vec::new();
        reactor.options.poll_timeout = Duration::from_millis(1);
        reactor.process(&mut removed);
        assert_eq!(reactor.state(), ReactorState::Running);
        reactor.stop();
        assert_eq!(reactor.state(), ReactorState::Stopped);
        assert!(!reactor.waker().is_armed());
        crate::test_complete!("lifecycle_states");
    }

    #[test]
    fn echo_then_peer_close() {
        init_test("echo_then_peer_close");
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_millis(20);
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), options);
        reactor.start().expect("start");

        let (item, mut client) = item();
        let key = item.key();
        reactor.work_added(item);
        assert!(reactor.contains(&key));
        assert!(reactor.token_of(&key).is_some());
        assert_eq!(handler.count("opened"), 1);
        assert!(reactor.connection(&key).is_some_and(Connection::is_open));

        client.write_all(b"abc").expect("write");
        let mut removed = Vec::new();
        tick_until(&mut reactor, &mut removed, |_, _| handler.count("request") == 1);
        let mut echo = [0u8; 3];
        client.read_exact(&mut echo).expect("echo");
        assert_eq!(&echo, b"abc");

        drop(client);
        tick_until(&mut reactor, &mut removed, |r, removed| {
            !r.contains(&key) && removed.contains(&key)
        });
        assert_eq!(handler.count("request"), 1, "close is not a request");
        assert_eq!(handler.count("closed"), 1);
        assert_eq!(reactor.connection_count(), 0);
        reactor.stop();
        assert_eq!(handler.count("closed"), 1, "stop does not close twice");
        crate::test_complete!("echo_then_peer_close");
    }

    #[test]
    fn deadline_expiry_removes_once() {
        init_test("deadline_expiry_removes_once");
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_secs(5);
        options.connection_timeout = Duration::from_millis(30);
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), options);
        reactor.start().expect("start");
        let (item, _client) = item();
        let key = item.key();
        reactor.work_added(item);

        let started = Instant::now();
        let mut removed = Vec::new();
        tick_until(&mut reactor, &mut removed, |_, removed| !removed.is_empty());
        let elapsed = started.elapsed();
        crate::assert_with_log!(
            elapsed < Duration::from_secs(2),
            "expired key reported without waiting out the poll timeout",
            "< 2s",
            elapsed
        );
        assert!(!reactor.contains(&key));
        assert_eq!(removed, vec![key]);
        reactor.options.poll_timeout = Duration::from_millis(5);
        reactor.process(&mut removed);
        assert_eq!(removed, vec![key], "removed once");
        assert_eq!(handler.count("closed"), 1);
        crate::test_complete!("deadline_expiry_removes_once");
    }

    #[test]
    fn ready_connections_beyond_events_capacity_are_dispatched() {
        init_test("ready_connections_beyond_events_capacity_are_dispatched");
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_millis(20);
        options.events_capacity = 1;
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), options);
        reactor.start().expect("start");
        let (a, mut client_a) = item();
        let (b, mut client_b) = item();
        reactor.work_added(a);
        reactor.work_added(b);

        client_a.write_all(b"a").expect("write");
        client_b.write_all(b"b").expect("write");
        let mut removed = Vec::new();
        tick_until(&mut reactor, &mut removed, |_, _| handler.count("request") == 2);
        for client in [&mut client_a, &mut client_b] {
            client
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("timeout");
            let mut echo = [0u8; 1];
            client.read_exact(&mut echo).expect("echo");
        }
        assert_eq!(reactor.connection_count(), 2);
        assert!(removed.is_empty());
        reactor.stop();
        crate::test_complete!("ready_connections_beyond_events_capacity_are_dispatched");
    }

    #[test]
    fn upgrade_to_new_descriptor_is_re_registered() {
        init_test("upgrade_to_new_descriptor_is_re_registered");
        let (server, mut client, peer) = tcp_pair().expect("pair");
        let spare = server.try_clone().expect("duplicate");
        let spare_fd = spare.as_raw_fd();
        let registry = SocketRegistry::new().with_upgrader(
            "duplicate",
            Arc::new(DuplicateUpgrader {
                spare: Mutex::new(Some(spare)),
            }),
        );
        let handler = Arc::new(UpgradeOnFirstRequest::default());
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_millis(20);
        let mut reactor = reactor_for(&handler, registry, options);
        reactor.start().expect("start");

        let item = WorkItem::new(server, peer).expect("item");
        let key = item.key();
        let original_fd = item.stream().as_raw_fd();
        reactor.work_added(item);
        let token = reactor.token_of(&key).expect("token");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        client.write_all(b"one").expect("write");
        let mut removed = Vec::new();
        tick_until(&mut reactor, &mut removed, |_, _| {
            handler.requests.load(Ordering::SeqCst) == 1
        });
        let mut echo = [0u8; 3];
        client.read_exact(&mut echo).expect("first echo");
        assert_eq!(&echo, b"one");
        assert_ne!(spare_fd, original_fd);
        assert_eq!(reactor.connections[&token].fd, spare_fd, "registration follows the upgrade");
        assert_eq!(
            reactor.connection(&key).and_then(Connection::raw_fd),
            Some(spare_fd)
        );

        crate::test_section!("second request on the upgraded transport");
        client.write_all(b"two").expect("write");
        tick_until(&mut reactor, &mut removed, |_, _| {
            handler.requests.load(Ordering::SeqCst) == 2
        });
        client.read_exact(&mut echo).expect("second echo");
        assert_eq!(&echo, b"two");
        assert!(removed.is_empty(), "connection kept: {removed:?}");
        reactor.stop();
        crate::test_complete!("upgrade_to_new_descriptor_is_re_registered");
    }

    #[test]
    fn buffered_input_is_dispatched_without_readiness() {
        init_test("buffered_input_is_dispatched_without_readiness");
        let registry = SocketRegistry::new().with_upgrader("trickle", Arc::new(TrickleUpgrader));
        let handler = Arc::new(Chunks::default());
        let mut options = ReactorOptions::default();
        // A tick that waited on the socket would take the whole poll timeout.
        options.poll_timeout = Duration::from_secs(5);
        options.upgrader = Some("trickle".to_string());
        let mut reactor = reactor_for(&handler, registry, options);
        reactor.start().expect("start");

        let (item, mut client) = item();
        reactor.work_added(item);
        client.write_all(b"abc").expect("write");
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let mut removed = Vec::new();
        for _ in 0..3 {
            reactor.process(&mut removed);
        }
        let elapsed = started.elapsed();
        crate::assert_with_log!(
            elapsed < Duration::from_secs(2),
            "buffered bytes dispatched without waiting for the socket",
            "< 2s",
            elapsed
        );
        assert_eq!(
            *handler.seen.lock(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert!(removed.is_empty());
        reactor.stop();
        crate::test_complete!("buffered_input_is_dispatched_without_readiness");
    }

    #[test]
    fn admission_sets_nodelay() {
        init_test("admission_sets_nodelay");
        let (mut reactor, _) = reactor_with(Arc::new(SystemPollerFactory), ReactorOptions::default());
        reactor.start().expect("start");
        let (server, _client, peer) = tcp_pair().expect("pair");
        server.set_nodelay(false).expect("reset");
        let observer = server.try_clone().expect("clone");
        reactor.work_added(WorkItem::new(server, peer).expect("item"));
        assert!(observer.nodelay().expect("nodelay"), "TCP_NODELAY set on admission");
        reactor.stop();
        crate::test_complete!("admission_sets_nodelay");
    }

    #[test]
    fn work_removed_is_tolerant() {
        init_test("work_removed_is_tolerant");
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), ReactorOptions::default());
        reactor.start().expect("start");
        let (item, _client) = item();
        let key = item.key();
        reactor.work_added(item);

        reactor.work_removed(&key);
        reactor.work_removed(&key);
        let stranger = WorkKey::next("127.0.0.1:9".parse().expect("addr"), 9);
        reactor.work_removed(&stranger);
        assert_eq!(handler.count("closed"), 1);
        assert!(!reactor.contains(&key));
        reactor.stop();
        crate::test_complete!("work_removed_is_tolerant");
    }

    #[test]
    fn stop_closes_remaining_connections() {
        init_test("stop_closes_remaining_connections");
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), ReactorOptions::default());
        reactor.start().expect("start");
        let (a, mut client_a) = item();
        let (b, _client_b) = item();
        reactor.work_added(a);
        reactor.work_added(b);
        assert_eq!(reactor.connection_count(), 2);

        reactor.stop();
        assert_eq!(handler.count("closed"), 2);
        assert_eq!(reactor.connection_count(), 0);
        client_a
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0u8; 1];
        assert_eq!(client_a.read(&mut buf).expect("eof"), 0, "socket released");
        crate::test_complete!("stop_closes_remaining_connections");
    }

    #[test]
    fn work_before_start_is_rejected() {
        init_test("work_before_start_is_rejected");
        let (mut reactor, handler) = reactor_with(Arc::new(SystemPollerFactory), ReactorOptions::default());
        let (item, _client) = item();
        let key = item.key();
        reactor.work_added(item);
        assert!(!reactor.contains(&key));
        assert_eq!(handler.count("opened"), 0);

        reactor.start().expect("start");
        reactor.options.poll_timeout = Duration::from_millis(1);
        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert_eq!(removed, vec![key], "rejected key reported to the pool");
        crate::test_complete!("work_before_start_is_rejected");
    }

    #[test]
    fn lab_poller_drives_dispatch() {
        init_test("lab_poller_drives_dispatch");
        let factory = Arc::new(LabPollerFactory::new());
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_millis(10);
        let (mut reactor, handler) = reactor_with(Arc::clone(&factory) as Arc<dyn PollerFactory>, options);
        reactor.start().expect("start");
        let lab: Arc<LabPoller> = factory.pollers().pop().expect("poller created");

        let (item, mut client) = item();
        let key = item.key();
        reactor.work_added(item);
        let token = reactor.token_of(&key).expect("token");

        client.write_all(b"hi").expect("write");
        std::thread::sleep(Duration::from_millis(20));
        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert_eq!(handler.count("request"), 0, "no readiness injected yet");

        lab.set_ready(token, Interest::READABLE);
        reactor.process(&mut removed);
        assert_eq!(handler.count("request"), 1);
        assert_eq!(lab.registration_count(), 1);
        reactor.stop();
        assert_eq!(lab.registration_count(), 0);
        crate::test_complete!("lab_poller_drives_dispatch");
    }

    #[test]
    fn wake_cuts_poll_short() {
        init_test("wake_cuts_poll_short");
        let mut options = ReactorOptions::default();
        options.poll_timeout = Duration::from_secs(10);
        let (mut reactor, _) = reactor_with(Arc::new(SystemPollerFactory), options);
        reactor.start().expect("start");
        let waker = reactor.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.wake()
        });
        let started = Instant::now();
        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert!(handle.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(5));
        reactor.stop();
        crate::test_complete!("wake_cuts_poll_short");
    }
}
