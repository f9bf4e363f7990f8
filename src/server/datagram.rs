//! Connectionless service.

use super::{stop_on_error, Common, Counters, Lifecycle, ServiceBuilder, ServiceState, ServiceStats};
use crate::config::{ServiceConfig, TransportKind};
use crate::connection::Datagram;
use crate::error::Result;
use crate::handler::DatagramHandler;
use crate::pool::{PoolSpec, TaskFactory, ThreadedPoolFactory, WorkPool, WorkPoolFactory};
use crate::reactor::DatagramReactor;
use crate::tracing_compat::{trace, warn};
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Receives datagrams and spreads them over a pool of [`DatagramReactor`]s.
///
/// Each datagram is one request: the handler sees `opened`, `request` and
/// `closed` for it in a row, and replies through [`Datagram::send`].
pub struct DatagramService<H: DatagramHandler, F: WorkPoolFactory = ThreadedPoolFactory> {
    common: Common,
    handler: Arc<H>,
    pool_factory: F,
    lifecycle: Lifecycle<Datagram>,
}

impl<H: DatagramHandler> DatagramService<H> {
    /// Starts assembling a datagram service for `config` served by `handler`.
    #[must_use]
    pub fn builder(config: ServiceConfig, handler: Arc<H>) -> ServiceBuilder<H> {
        ServiceBuilder::new(config, handler)
    }
}

impl<H: DatagramHandler, F: WorkPoolFactory> ServiceBuilder<H, F> {
    /// Builds a connectionless service.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid or not of type
    /// `connectionless`.
    pub fn build_datagram(self) -> Result<DatagramService<H, F>> {
        let parts = self.into_parts(TransportKind::Connectionless)?;
        Ok(DatagramService {
            lifecycle: Lifecycle::new(&parts.common.name),
            common: parts.common,
            handler: parts.handler,
            pool_factory: parts.pool_factory,
        })
    }
}

impl<H: DatagramHandler, F: WorkPoolFactory> DatagramService<H, F> {
    /// Binds, starts the pool and the receive loop. Returns the bound address.
    ///
    /// # Errors
    ///
    /// As [`Service::start`](super::Service::start).
    pub fn start(&self) -> Result<SocketAddr> {
        self.lifecycle.start_with(|| {
            let socket: UdpSocket = self.common.bind_socket()?.into();
            let socket = Arc::new(socket);
            let local_addr = socket.local_addr()?;

            let spec = PoolSpec::from_config(self.common.name.clone(), &self.common.config.pool)
                .description(format!("datagram reactors for {local_addr}"));
            let pool = self.pool_factory.create_pool(spec, self.task_factory())?;
            pool.start()?;

            let fd = socket.as_raw_fd();
            let receiver = Receiver {
                name: self.common.name.clone(),
                buf: vec![0; self.common.config.chunk_size],
                socket,
                pool: Arc::clone(&pool),
                counters: Arc::clone(&self.common.counters),
            };
            let spawned = self.common.spawn_loop(fd, local_addr, Arc::clone(&pool), {
                let mut receiver = receiver;
                move || receiver.drain()
            });
            stop_on_error(&pool, spawned)
        })
    }

    /// Stops the receive loop, then every reactor. Idempotent.
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

    /// Datagrams queued or in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lifecycle.work_count()
    }

    /// Receive counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        self.common.counters.snapshot()
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.common.config
    }

    fn task_factory(&self) -> TaskFactory<DatagramReactor<H>> {
        let handler = Arc::clone(&self.handler);
        let poll_timeout = self.common.config.timeouts.poll;
        Arc::new(move |index| DatagramReactor::new(index, Arc::clone(&handler), poll_timeout))
    }
}

impl<H: DatagramHandler, F: WorkPoolFactory> fmt::Debug for DatagramService<H, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramService")
            .field("name", &self.common.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Receive side of the loop. Reads at most `chunk_size` bytes per datagram;
/// the rest of a longer datagram is discarded by the kernel.
struct Receiver {
    name: String,
    buf: Vec<u8>,
    socket: Arc<UdpSocket>,
    pool: Arc<dyn WorkPool<Datagram>>,
    counters: Arc<Counters>,
}

impl Receiver {
    fn drain(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, peer)) => self.admit(len, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.counters.failed();
                    warn!(service = %self.name, error = %err, "receive failed");
                    return;
                }
            }
        }
    }

    fn admit(&self, len: usize, peer: SocketAddr) {
        let datagram =
            match Datagram::new(self.buf[..len].to_vec(), Arc::clone(&self.socket), peer) {
                Ok(datagram) => datagram,
                Err(err) => {
                    self.counters.failed();
                    warn!(service = %self.name, %peer, error = %err, "cannot wrap datagram");
                    return;
                }
            };
        let key = datagram.key();
        match self.pool.insert_work(datagram) {
            Ok(()) => {
                self.counters.accepted();
                trace!(service = %self.name, %key, bytes = len, "datagram received");
            }
            Err(err) => {
                self.counters.rejected();
                warn!(service = %self.name, %key, error = %err, "pool refused datagram");
            }
        }
    }
}
