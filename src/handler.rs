//! Protocol callbacks.
//!
//! A service is generic over its handler. One handler instance is shared by
//! every reactor of the service, so callbacks take `&self` and handlers keep
//! per-connection state in the connection's property bag.
//!
//! Callback order for a connection, all on its reactor's thread:
//!
//! ```text
//! handle_opened ─▶ handle_request* ─▶ handle_closed
//! ```
//!
//! `handle_closed` runs exactly once, after the last request and before the
//! socket is released. A request that returns an error or panics is treated
//! as a decision to close.

use crate::connection::{Connection, Datagram};
use crate::error::Result;
use crate::tracing_compat::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// What to do with a connection after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Re-arm the idle deadline and wait for more input.
    KeepOpen,
    /// Remove and close the connection.
    Close,
}

/// Callbacks for connection-oriented services.
pub trait ClientServiceHandler: Send + Sync + 'static {
    /// The connection was registered and opened.
    fn handle_opened(&self, _connection: &mut Connection) {}

    /// The connection is being removed; its socket is still usable.
    fn handle_closed(&self, _connection: &mut Connection) {}

    /// The connection has input. Read it with
    /// [`retrieve`](Connection::retrieve) and answer with
    /// [`send_default`](Connection::send_default).
    ///
    /// # Errors
    ///
    /// Any error closes the connection.
    fn handle_request(&self, connection: &mut Connection) -> Result<Disposition>;
}

/// Callbacks for connectionless services, once per datagram.
pub trait DatagramHandler: Send + Sync + 'static {
    /// Runs before [`handle_request`](Self::handle_request).
    fn handle_opened(&self, _datagram: &Datagram) {}

    /// Runs after [`handle_request`](Self::handle_request).
    fn handle_closed(&self, _datagram: &Datagram) {}

    /// Handles the payload.
    ///
    /// # Errors
    ///
    /// Errors are logged; the datagram is discarded either way.
    fn handle_request(&self, datagram: &Datagram) -> Result<()>;
}

/// Adapts a closure into a [`ClientServiceHandler`] with no open/close hooks.
#[derive(Debug, Clone, Copy)]
pub struct FnHandler<F>(pub F);

impl<F> ClientServiceHandler for FnHandler<F>
where
    F: Fn(&mut Connection) -> Result<Disposition> + Send + Sync + 'static,
{
    fn handle_request(&self, connection: &mut Connection) -> Result<Disposition> {
        (self.0)(connection)
    }
}

impl<F> DatagramHandler for FnHandler<F>
where
    F: Fn(&Datagram) -> Result<()> + Send + Sync + 'static,
{
    fn handle_request(&self, datagram: &Datagram) -> Result<()> {
        (self.0)(datagram)
    }
}

/// Runs a callback, turning a panic into `None`.
pub(crate) fn contained<T>(what: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(callback = what, panic = %detail, "handler panicked");
            None
        }
    }
}

/// Runs `handle_request`; errors and panics become [`Disposition::Close`].
pub(crate) fn dispatch_request<H: ClientServiceHandler + ?Sized>(
    handler: &H,
    connection: &mut Connection,
) -> Disposition {
    let key = connection.key();
    match contained("handle_request", || handler.handle_request(connection)) {
        Some(Ok(disposition)) => disposition,
        Some(Err(err)) => {
            warn!(key = %key, error = %err, "request failed, closing");
            Disposition::Close
        }
        None => Disposition::Close,
    }
}
