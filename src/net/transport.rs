//! Byte-stream abstraction owned by a connection.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// A connected, bidirectional byte stream.
///
/// The reactor registers [`raw_fd`](Self::raw_fd) with its poller and
/// toggles blocking mode around bounded reads and writes, so every
/// implementation must expose the descriptor that readiness is reported on.
/// Wrappers (TLS sessions and similar) forward the socket-level calls to the
/// stream they wrap.
pub trait Transport: Read + Write + Send + fmt::Debug {
    /// Descriptor to register for readiness.
    fn raw_fd(&self) -> RawFd;

    /// Remote address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Switches between blocking and non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Bounds blocking reads. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounds blocking writes. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Reads without consuming. `Ok(0)` means the peer closed.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shuts down both directions.
    fn shutdown(&self) -> io::Result<()>;

    /// Bytes already decoded and held in user space.
    ///
    /// Such bytes never raise socket readiness, so the reactor dispatches a
    /// connection again without waiting while this is non-zero.
    fn buffered_input(&self) -> usize {
        0
    }
}

impl Transport for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Self::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Self::local_addr(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_write_timeout(self, timeout)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        Self::peek(self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        match Self::shutdown(self, Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, tcp_pair};

    #[test]
    fn tcp_stream_peek_sees_close() {
        init_test_logging();
        crate::test_phase!("tcp_stream_peek_sees_close");
        let (server, client, _) = tcp_pair().expect("pair");
        let transport: Box<dyn Transport> = Box::new(server);

        let mut client = client;
        client.write_all(b"hi").expect("write");
        let mut buf = [0u8; 8];
        let n = transport.peek(&mut buf).expect("peek");
        crate::assert_with_log!(n == 2, "peek sees pending bytes", 2, n);

        drop(client);
        let mut transport = transport;
        let mut drained = [0u8; 8];
        transport.read_exact(&mut drained[..2]).expect("drain");
        let n = transport.peek(&mut buf).expect("peek after close");
        crate::assert_with_log!(n == 0, "peek reports close", 0, n);
        assert_eq!(transport.buffered_input(), 0);
        crate::test_complete!("tcp_stream_peek_sees_close");
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        init_test_logging();
        let (server, _client, _) = tcp_pair().expect("pair");
        Transport::shutdown(&server).expect("first");
        Transport::shutdown(&server).expect("second");
    }
}
