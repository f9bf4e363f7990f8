//! Connection-oriented service.

use super::{stop_on_error, Common, Counters, Lifecycle, ServiceBuilder, ServiceState, ServiceStats};
use crate::config::{ServiceConfig, TransportKind};
use crate::error::Result;
use crate::handler::ClientServiceHandler;
use crate::net::SocketRegistry;
use crate::pool::{
    PoolSpec, PoolWork, TaskFactory, ThreadedPoolFactory, WorkPool, WorkPoolFactory,
};
use crate::reactor::{ConnectionReactor, ReactorOptions, WorkItem};
use crate::tracing_compat::{debug, warn};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Accepts stream connections and spreads them over a pool of
/// [`ConnectionReactor`]s.
pub struct Service<H: ClientServiceHandler, F: WorkPoolFactory = ThreadedPoolFactory> {
    common: Common,
    handler: Arc<H>,
    pool_factory: F,
    lifecycle: Lifecycle<WorkItem>,
}

impl<H: ClientServiceHandler> Service<H> {
    /// Starts assembling a service for `config` served by `handler`.
    #[must_use]
    pub fn builder(config: ServiceConfig, handler: Arc<H>) -> ServiceBuilder<H> {
        ServiceBuilder::new(config, handler)
    }
}

impl<H: ClientServiceHandler, F: WorkPoolFactory> ServiceBuilder<H, F> {
    /// Builds a connection-oriented service.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid or not of type `connection`.
    pub fn build(self) -> Result<Service<H, F>> {
        let parts = self.into_parts(TransportKind::Connection)?;
        Ok(Service {
            lifecycle: Lifecycle::new(&parts.common.name),
            common: parts.common,
            handler: parts.handler,
            pool_factory: parts.pool_factory,
        })
    }
}

impl<H: ClientServiceHandler, F: WorkPoolFactory> Service<H, F> {
    /// Binds, starts the pool and the accept loop. Returns the bound address.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition` unless idle
    /// - `PortStarvation` when port `0` cannot be satisfied
    /// - `SocketProviderNotFound` for an unknown provider name
    /// - `Io` for bind, listen and thread failures
    ///
    /// On failure the service is idle again and may be restarted.
    pub fn start(&self) -> Result<SocketAddr> {
        self.lifecycle.start_with(|| {
            let socket = self.common.bind_socket()?;
            socket.listen(self.common.config.listen_backlog)?;
            let listener: TcpListener = socket.into();
            let local_addr = listener.local_addr()?;

            let spec = PoolSpec::from_config(self.common.name.clone(), &self.common.config.pool)
                .description(format!("connection reactors for {local_addr}"));
            let pool = self.pool_factory.create_pool(spec, self.task_factory())?;
            pool.start()?;

            let fd = listener.as_raw_fd();
            let accept = Acceptor {
                name: self.common.name.clone(),
                listener,
                pool: Arc::clone(&pool),
                counters: Arc::clone(&self.common.counters),
            };
            let spawned =
                self.common
                    .spawn_loop(fd, local_addr, Arc::clone(&pool), move || accept.drain());
            stop_on_error(&pool, spawned)
        })
    }

    /// Stops the accept loop, then every reactor. Idempotent.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Bound address while listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    /// Connections currently owned by reactors.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lifecycle.work_count()
    }

    /// Live pool workers.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.lifecycle.thread_count()
    }

    /// Accept counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        self.common.counters.snapshot()
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.common.config
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.common.name
    }

    /// Socket providers and upgraders in use.
    #[must_use]
    pub fn registry(&self) -> &SocketRegistry {
        &self.common.registry
    }

    fn task_factory(&self) -> TaskFactory<ConnectionReactor<H>> {
        let handler = Arc::clone(&self.handler);
        let registry = Arc::clone(&self.common.registry);
        let pollers = Arc::clone(&self.common.poller_factory);
        let options = ReactorOptions::from_config(&self.common.config, &self.common.registry);
        Arc::new(move |index| {
            ConnectionReactor::new(
                index,
                Arc::clone(&handler),
                Arc::clone(&registry),
                Arc::clone(&pollers),
                options.clone(),
            )
        })
    }
}

impl<H: ClientServiceHandler, F: WorkPoolFactory> fmt::Debug for Service<H, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.common.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Accept side of the loop, owning the listener.
struct Acceptor {
    name: String,
    listener: TcpListener,
    pool: Arc<dyn WorkPool<WorkItem>>,
    counters: Arc<Counters>,
}

impl Acceptor {
    fn drain(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.counters.failed();
                    warn!(service = %self.name, error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(true) {
            self.counters.failed();
            warn!(service = %self.name, %peer, error = %err, "cannot configure accepted socket");
            return;
        }
        let item = match WorkItem::new(stream, peer) {
            Ok(item) => item,
            Err(err) => {
                self.counters.failed();
                warn!(service = %self.name, %peer, error = %err, "cannot wrap accepted socket");
                return;
            }
        };
        let key = item.key();
        match self.pool.insert_work(item) {
            Ok(()) => {
                self.counters.accepted();
                debug!(service = %self.name, %key, "connection accepted");
            }
            Err(err) => {
                self.counters.rejected();
                warn!(service = %self.name, %key, error = %err, "pool refused connection");
            }
        }
    }
}
