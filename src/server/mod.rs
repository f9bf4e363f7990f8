//! Services: a bound socket, one loop thread, and a work pool of reactors.
//!
//! - [`Service`] accepts stream connections and hands each to a
//!   [`ConnectionReactor`](crate::reactor::ConnectionReactor)
//! - [`DatagramService`] receives datagrams and hands each to a
//!   [`DatagramReactor`](crate::reactor::DatagramReactor)
//!
//! Both are assembled with a [`ServiceBuilder`] that injects the handler, the
//! socket registry, the pool and poller factories, and optionally a private
//! [`PortAllocator`].
//!
//! # Architecture
//!
//! ```text
//! Service
//! │
//! ├── loop thread: poll(socket, clientConnectionTimeout) ─▶ accept/recv ─▶ insert_work
//! │
//! └── WorkPool
//!     ├── worker 0: reactor.process() loop
//!     └── worker 1: reactor.process() loop
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─start()─▶ Starting ─▶ Listening ─stop()─▶ Stopping ─▶ Stopped
//!         │
//!         └─ failure ─▶ Idle
//! ```
//!
//! `stop()` requests the loop to exit, waits for its acknowledgement, joins
//! it, then stops the pool's tasks and the pool. It is idempotent and runs on
//! drop.

pub mod datagram;
pub mod service;
pub mod stop;

pub use datagram::DatagramService;
pub use service::Service;
pub use stop::{LoopPhase, StopSignal};

use crate::config::{ServiceConfig, TransportKind};
use crate::error::{Error, Result};
use crate::net::SocketRegistry;
use crate::poller::{default_poller_factory, Events, Interest, Poller, PollerFactory, Token};
use crate::pool::{PoolWork, ThreadedPoolFactory, WorkPool};
use crate::port::PortAllocator;
use crate::tracing_compat::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use socket2::Socket;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Attempts at binding an allocated port before giving up.
const MAX_BIND_ATTEMPTS: usize = 16;

/// Token of the service socket in the loop's poller.
const SOCKET_TOKEN: Token = Token(0);

/// Lifecycle of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Built, not started.
    Idle = 0,
    /// Binding and starting the pool.
    Starting = 1,
    /// Loop running.
    Listening = 2,
    /// Tearing down.
    Stopping = 3,
    /// Terminal.
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Listening,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters collected by the service loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Units handed to the pool.
    pub accepted: u64,
    /// Units the pool refused (saturated or stopped).
    pub rejected: u64,
    /// Accept, receive or setup failures.
    pub failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Assembles a [`Service`] or a [`DatagramService`].
///
/// # Example
///
/// ```no_run
/// use pooled_reactor::config::{ServiceConfig, TransportKind};
/// use pooled_reactor::connection::Connection;
/// use pooled_reactor::handler::{Disposition, FnHandler};
/// use pooled_reactor::server::Service;
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnHandler(|conn: &mut Connection| -> pooled_reactor::Result<Disposition> {
///     let data = conn.retrieve()?;
///     conn.send_default(&data)?;
///     Ok(Disposition::KeepOpen)
/// }));
/// let config = ServiceConfig::new(TransportKind::Connection).bind_host("127.0.0.1");
/// let service = Service::builder(config, handler).name("echo").build().unwrap();
/// let addr = service.start().unwrap();
/// println!("listening on {addr}");
/// service.stop();
/// ```
pub struct ServiceBuilder<H, F = ThreadedPoolFactory> {
    name: String,
    config: ServiceConfig,
    handler: Arc<H>,
    registry: SocketRegistry,
    pool_factory: F,
    poller_factory: Arc<dyn PollerFactory>,
    ports: Option<Arc<PortAllocator>>,
}

impl<H> ServiceBuilder<H> {
    pub(crate) fn new(config: ServiceConfig, handler: Arc<H>) -> Self {
        Self {
            name: "pooled-reactor".to_string(),
            config,
            handler,
            registry: SocketRegistry::new(),
            pool_factory: ThreadedPoolFactory,
            poller_factory: default_poller_factory(),
            ports: None,
        }
    }
}

impl<H, F> ServiceBuilder<H, F> {
    /// Names the service; used for thread names and logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Socket providers and upgraders available to the service.
    #[must_use]
    pub fn registry(mut self, registry: SocketRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Poller backend for the loop thread and every reactor.
    #[must_use]
    pub fn poller_factory(mut self, factory: Arc<dyn PollerFactory>) -> Self {
        self.poller_factory = factory;
        self
    }

    /// Private port allocator used instead of [`PortAllocator::global`].
    #[must_use]
    pub fn port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Replaces the work pool implementation.
    #[must_use]
    pub fn pool_factory<G>(self, pool_factory: G) -> ServiceBuilder<H, G> {
        ServiceBuilder {
            name: self.name,
            config: self.config,
            handler: self.handler,
            registry: self.registry,
            pool_factory,
            poller_factory: self.poller_factory,
            ports: self.ports,
        }
    }

    /// Validates the configuration for `kind` and splits the builder.
    fn into_parts(self, kind: TransportKind) -> Result<Parts<H, F>> {
        if self.config.transport != kind {
            return Err(Error::config(format!(
                "service of type {} cannot run a {kind} transport",
                self.config.transport
            )));
        }
        let mut config = self.config;
        config.validate()?;
        config.normalize();
        Ok(Parts {
            common: Common {
                name: self.name,
                config,
                registry: Arc::new(self.registry),
                poller_factory: self.poller_factory,
                ports: self.ports,
                counters: Arc::new(Counters::default()),
            },
            handler: self.handler,
            pool_factory: self.pool_factory,
        })
    }
}

impl<H, F> fmt::Debug for ServiceBuilder<H, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Parts<H, F> {
    common: Common,
    handler: Arc<H>,
    pool_factory: F,
}

/// Settings and collaborators shared by both service kinds.
#[derive(Debug)]
pub(crate) struct Common {
    name: String,
    config: ServiceConfig,
    registry: Arc<SocketRegistry>,
    poller_factory: Arc<dyn PollerFactory>,
    ports: Option<Arc<PortAllocator>>,
    counters: Arc<Counters>,
}

impl Common {
    fn ports(&self) -> &PortAllocator {
        match self.ports.as_deref() {
            Some(ports) => ports,
            None => PortAllocator::global(),
        }
    }

    /// Creates the service socket through the configured provider and binds
    /// it. Port `0` draws from the allocator, retrying ports already in use.
    fn bind_socket(&self) -> Result<Socket> {
        let config = &self.config;
        let provider = self.registry.provider(config.socket_provider.as_deref())?;
        let auto = config.port == 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let port = if auto {
                self.ports().generate_port()?
            } else {
                config.port
            };
            let addr = resolve(&config.bind_host, port)?;
            let socket =
                provider.provide_socket(config.transport, &addr, &config.socket_parameters)?;
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    socket.set_nonblocking(true)?;
                    debug!(service = %self.name, %addr, "socket bound");
                    return Ok(socket);
                }
                Err(err)
                    if auto
                        && err.kind() == io::ErrorKind::AddrInUse
                        && attempt < MAX_BIND_ATTEMPTS =>
                {
                    debug!(service = %self.name, port, "allocated port in use, trying the next");
                }
                Err(err) => {
                    return Err(Error::from(err).with_message(format!("cannot bind {addr}")));
                }
            }
        }
    }

    /// Registers the socket with a fresh poller and starts the loop thread.
    ///
    /// `drain` runs on every readiness and must consume input until
    /// `WouldBlock`. It owns the socket; dropping it closes the socket
    /// before the loop acknowledges the stop.
    fn spawn_loop<W: PoolWork>(
        &self,
        fd: RawFd,
        local_addr: SocketAddr,
        pool: Arc<dyn WorkPool<W>>,
        drain: impl FnMut() + Send + 'static,
    ) -> Result<Running<W>> {
        let poller = self.poller_factory.create()?;
        poller.register(fd, SOCKET_TOKEN, Interest::READABLE)?;
        let stop = StopSignal::new();
        let thread = {
            let poller = Arc::clone(&poller);
            let stop = stop.clone();
            let name = self.name.clone();
            let interval = self.config.timeouts.accept_poll;
            thread::Builder::new()
                .name(format!("{}-loop", self.name))
                .spawn(move || run_loop(&name, &*poller, &stop, interval, drain))
                .map_err(|err| Error::from(err).with_message("failed to spawn service loop"))?
        };
        Ok(Running {
            pool,
            poller,
            stop,
            thread: Some(thread),
            local_addr,
            ack_timeout: self
                .config
                .timeouts
                .accept_poll
                .saturating_mul(2)
                .saturating_add(Duration::from_secs(1)),
        })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::config(format!("bind host {host:?} did not resolve")))
}

/// The accept/receive loop.
fn run_loop(
    name: &str,
    poller: &dyn Poller,
    stop: &StopSignal,
    interval: Duration,
    mut drain: impl FnMut(),
) {
    info!(service = %name, "service loop started");
    let mut events = Events::with_capacity(4);
    while !stop.is_stop_requested() {
        match poller.poll(&mut events, Some(interval)) {
            Ok(0) => {
                trace!(service = %name, "service loop idle");
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                error!(service = %name, error = %err, "service poll failed, loop exiting");
                break;
            }
        }
        if stop.is_stop_requested() {
            break;
        }
        drain();
        if let Err(err) = poller.modify(SOCKET_TOKEN, Interest::READABLE) {
            error!(service = %name, error = %err, "cannot re-arm service socket, loop exiting");
            break;
        }
    }
    if let Err(err) = poller.deregister(SOCKET_TOKEN) {
        trace!(service = %name, error = %err, "service socket deregister failed");
    }
    drop(drain);
    stop.acknowledge();
    info!(service = %name, "service loop stopped");
}

/// Resources of a listening service.
pub(crate) struct Running<W: PoolWork> {
    pool: Arc<dyn WorkPool<W>>,
    poller: Arc<dyn Poller>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    ack_timeout: Duration,
}

impl<W: PoolWork> Running<W> {
    fn shutdown(mut self, name: &str) {
        self.stop.request_stop();
        if let Err(err) = self.poller.wake() {
            warn!(service = %name, error = %err, "failed to wake service loop");
        }
        if !self.stop.wait_stopped(self.ack_timeout) {
            warn!(service = %name, "service loop did not acknowledge stop in time");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(service = %name, "service loop panicked");
            }
        }
        self.pool.stop_tasks();
        self.pool.stop();
    }
}

/// State machine shared by both service kinds.
pub(crate) struct Lifecycle<W: PoolWork> {
    name: String,
    state: AtomicU8,
    running: Mutex<Option<Running<W>>>,
    transition: Mutex<()>,
}

impl<W: PoolWork> Lifecycle<W> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: AtomicU8::new(ServiceState::Idle as u8),
            running: Mutex::new(None),
            transition: Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn start_with(
        &self,
        launch: impl FnOnce() -> Result<Running<W>>,
    ) -> Result<SocketAddr> {
        let _transition = self.transition.lock();
        let state = self.state();
        if state != ServiceState::Idle {
            return Err(Error::invalid_transition(state, ServiceState::Starting));
        }
        self.set(ServiceState::Starting);
        match launch() {
            Ok(running) => {
                let addr = running.local_addr;
                *self.running.lock() = Some(running);
                self.set(ServiceState::Listening);
                info!(service = %self.name, %addr, "service listening");
                Ok(addr)
            }
            Err(err) => {
                self.set(ServiceState::Idle);
                error!(service = %self.name, error = %err, "service failed to start");
                Err(err)
            }
        }
    }

    pub(crate) fn stop(&self) {
        let _transition = self.transition.lock();
        if self.state() != ServiceState::Listening {
            return;
        }
        self.set(ServiceState::Stopping);
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.shutdown(&self.name);
        }
        self.set(ServiceState::Stopped);
        info!(service = %self.name, "service stopped");
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    pub(crate) fn work_count(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |running| running.pool.work_count())
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |running| running.pool.thread_count())
    }
}

impl<W: PoolWork> Drop for Lifecycle<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops the pool again if the loop could not be started.
fn stop_on_error<W: PoolWork, T>(pool: &Arc<dyn WorkPool<W>>, result: Result<T>) -> Result<T> {
    if result.is_err() {
        pool.stop_tasks();
        pool.stop();
    }
    result
}
