//! Socket providers, upgraders, and the registry that names them.

use super::{SocketParameters, Transport};
use crate::config::TransportKind;
use crate::error::{Error, Result};
use crate::tracing_compat::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Creates the socket a service binds to.
///
/// The returned socket is unbound; the service binds it and, for
/// connection services, listens on it.
pub trait SocketProvider: Send + Sync + fmt::Debug {
    /// Creates a socket suitable for `kind` at `addr`.
    ///
    /// # Errors
    ///
    /// Socket creation or option failures.
    fn provide_socket(
        &self,
        kind: TransportKind,
        addr: &SocketAddr,
        params: &SocketParameters,
    ) -> io::Result<Socket>;
}

/// Wraps a freshly accepted transport.
///
/// On failure the original transport has been consumed and the connection
/// is closed.
pub trait SocketUpgrader: Send + Sync + fmt::Debug {
    /// Returns the upgraded transport.
    ///
    /// # Errors
    ///
    /// Handshake or configuration failures.
    fn upgrade_socket(
        &self,
        transport: Box<dyn Transport>,
        params: &SocketParameters,
    ) -> io::Result<Box<dyn Transport>>;
}

/// Plain OS sockets configured from well-known parameters.
///
/// | Parameter | Effect |
/// |-----------|--------|
/// | `reuseAddress` | `SO_REUSEADDR`, default `true` |
/// | `reusePort` | `SO_REUSEPORT`, default `false` |
/// | `onlyV6` | `IPV6_V6ONLY` for IPv6 addresses |
/// | `recvBufferSize` | `SO_RCVBUF` in bytes |
/// | `sendBufferSize` | `SO_SNDBUF` in bytes |
///
/// Unrecognized parameters are ignored; they belong to upgraders.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSocketProvider;

impl RawSocketProvider {
    fn flag(params: &SocketParameters, key: &str, default: bool) -> io::Result<bool> {
        match params.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
            Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
            Some(v) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{key} must be a boolean, got {v:?}"),
            )),
        }
    }

    fn size(params: &SocketParameters, key: &str) -> io::Result<Option<usize>> {
        params
            .get(key)
            .map(|v| {
                v.trim().parse::<usize>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{key} must be a byte count, got {v:?}"),
                    )
                })
            })
            .transpose()
    }
}

impl SocketProvider for RawSocketProvider {
    fn provide_socket(
        &self,
        kind: TransportKind,
        addr: &SocketAddr,
        params: &SocketParameters,
    ) -> io::Result<Socket> {
        let (ty, protocol) = match kind {
            TransportKind::Connection => (Type::STREAM, Protocol::TCP),
            TransportKind::Connectionless => (Type::DGRAM, Protocol::UDP),
        };
        let socket = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;
        socket.set_reuse_address(Self::flag(params, "reuseAddress", true)?)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        if Self::flag(params, "reusePort", false)? {
            socket.set_reuse_port(true)?;
        }
        if addr.is_ipv6() && params.contains_key("onlyV6") {
            socket.set_only_v6(Self::flag(params, "onlyV6", false)?)?;
        }
        if let Some(size) = Self::size(params, "recvBufferSize")? {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = Self::size(params, "sendBufferSize")? {
            socket.set_send_buffer_size(size)?;
        }
        debug!(%addr, ?kind, "raw socket provided");
        Ok(socket)
    }
}

/// Named socket providers and upgraders.
///
/// A service looks up its provider by the configured name and, once per
/// accepted connection, the upgrader of the same name. A name with no
/// provider fails the service start with
/// [`ErrorKind::SocketProviderNotFound`](crate::error::ErrorKind::SocketProviderNotFound).
#[derive(Clone, Default)]
pub struct SocketRegistry {
    providers: HashMap<String, Arc<dyn SocketProvider>>,
    upgraders: HashMap<String, Arc<dyn SocketUpgrader>>,
}

impl SocketRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under `name`, replacing any previous one.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn SocketProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Registers an upgrader under `name`, replacing any previous one.
    #[must_use]
    pub fn with_upgrader(mut self, name: impl Into<String>, upgrader: Arc<dyn SocketUpgrader>) -> Self {
        self.upgraders.insert(name.into(), upgrader);
        self
    }

    /// Resolves the provider for an optional name. `None` yields the raw provider.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::SocketProviderNotFound`](crate::error::ErrorKind::SocketProviderNotFound)
    /// if no provider has that name.
    pub fn provider(&self, name: Option<&str>) -> Result<Arc<dyn SocketProvider>> {
        match name {
            None => Ok(Arc::new(RawSocketProvider)),
            Some(name) => self
                .providers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::provider_not_found(name)),
        }
    }

    /// Resolves the upgrader named `name`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::SocketUpgraderNotFound`](crate::error::ErrorKind::SocketUpgraderNotFound)
    /// if no upgrader has that name.
    pub fn upgrader(&self, name: &str) -> Result<Arc<dyn SocketUpgrader>> {
        self.upgraders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::upgrader_not_found(name))
    }

    /// Returns `true` if an upgrader is registered under `name`.
    #[must_use]
    pub fn has_upgrader(&self, name: &str) -> bool {
        self.upgraders.contains_key(name)
    }
}

impl fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<&String> = self.providers.keys().collect();
        providers.sort();
        let mut upgraders: Vec<&String> = self.upgraders.keys().collect();
        upgraders.sort();
        f.debug_struct("SocketRegistry")
            .field("providers", &providers)
            .field("upgraders", &upgraders)
            .finish()
    }
}
