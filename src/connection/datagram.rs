//! One-shot connectionless work unit.

use super::WorkKey;
use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// A received datagram plus the socket to answer on.
///
/// Datagrams are immutable and consumed once; they have no deadline and never
/// enter a reactor's connection maps.
pub struct Datagram {
    key: WorkKey,
    payload: Vec<u8>,
    socket: Arc<UdpSocket>,
}

impl Datagram {
    /// Wraps a payload received from `peer` on `socket`.
    ///
    /// # Errors
    ///
    /// `Io` if the socket has no local address.
    pub fn new(payload: Vec<u8>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Result<Self> {
        let port = socket.local_addr()?.port();
        Ok(Self {
            key: WorkKey::next(peer, port),
            payload,
            socket,
        })
    }

    /// Identity of this datagram.
    #[must_use]
    pub const fn key(&self) -> WorkKey {
        self.key
    }

    /// Sender address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.key.peer
    }

    /// Local port the datagram arrived on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.key.port
    }

    /// The received bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Sends `message` back to the sender in one datagram.
    ///
    /// # Errors
    ///
    /// `Io` if the write fails or is truncated.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(message, self.key.peer)?;
        if sent != message.len() {
            return Err(Error::from(io::Error::from(io::ErrorKind::WriteZero))
                .with_message(format!("sent {sent} of {} bytes", message.len())));
        }
        Ok(())
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("key", &self.key)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
