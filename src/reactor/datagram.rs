//! Task for connectionless services.
//!
//! Datagrams need no poller and no deadlines: each one is a complete request.
//! The reactor queues what the pool delivers and handles the whole batch on
//! the next tick, waiting on a [`WakeSignal`] while the queue is empty.

use super::ReactorState;
use crate::connection::{Datagram, WorkKey};
use crate::error::{Error, Result};
use crate::handler::{contained, DatagramHandler};
use crate::pool::{PoolTask, PoolWork, Wake, WakeHandle, WakeSignal};
use crate::tracing_compat::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

impl PoolWork for Datagram {
    type Key = WorkKey;

    fn key(&self) -> WorkKey {
        Datagram::key(self)
    }
}

/// Pool task handling datagrams one at a time.
pub struct DatagramReactor<H: DatagramHandler> {
    id: usize,
    handler: Arc<H>,
    poll_timeout: Duration,
    state: ReactorState,
    queue: VecDeque<Datagram>,
    signal: Arc<WakeSignal>,
    waker: WakeHandle,
}

impl<H: DatagramHandler> DatagramReactor<H> {
    /// Creates an idle reactor. `poll_timeout` bounds each idle wait.
    #[must_use]
    pub fn new(id: usize, handler: Arc<H>, poll_timeout: Duration) -> Self {
        Self {
            id,
            handler,
            poll_timeout,
            state: ReactorState::Idle,
            queue: VecDeque::new(),
            signal: Arc::new(WakeSignal::new()),
            waker: WakeHandle::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ReactorState {
        self.state
    }

    /// Datagrams waiting for the next tick.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn handle(&self, datagram: &Datagram) {
        let handler = &*self.handler;
        contained("handle_opened", || handler.handle_opened(datagram));
        match contained("handle_request", || handler.handle_request(datagram)) {
            Some(Err(err)) => {
                warn!(reactor = self.id, key = %datagram.key(), error = %err, "datagram request failed");
            }
            Some(Ok(())) | None => {}
        }
        contained("handle_closed", || handler.handle_closed(datagram));
    }
}

impl<H: DatagramHandler> PoolTask for DatagramReactor<H> {
    type Work = Datagram;

    fn start(&mut self) -> Result<()> {
        if self.state != ReactorState::Idle {
            return Err(Error::invalid_transition(self.state, ReactorState::Started));
        }
        self.waker
            .publish(Arc::clone(&self.signal) as Arc<dyn Wake>);
        self.state = ReactorState::Started;
        info!(reactor = self.id, "datagram reactor started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == ReactorState::Stopped {
            return;
        }
        let dropped = self.queue.len();
        self.queue.clear();
        self.waker.retract();
        self.state = ReactorState::Stopped;
        info!(reactor = self.id, dropped, "datagram reactor stopped");
    }

    fn process(&mut self, removed: &mut Vec<WorkKey>) {
        if !matches!(self.state, ReactorState::Started | ReactorState::Running) {
            return;
        }
        self.state = ReactorState::Running;
        if self.queue.is_empty() {
            self.signal.wait(self.poll_timeout);
        }
        while let Some(datagram) = self.queue.pop_front() {
            self.handle(&datagram);
            removed.push(datagram.key());
        }
    }

    fn waker(&self) -> WakeHandle {
        self.waker.clone()
    }

    fn work_added(&mut self, datagram: Datagram) {
        debug!(reactor = self.id, key = %datagram.key(), bytes = datagram.payload().len(), "datagram queued");
        self.queue.push_back(datagram);
    }

    fn work_removed(&mut self, key: &WorkKey) {
        self.queue.retain(|datagram| datagram.key() != *key);
    }
}

impl<H: DatagramHandler> fmt::Debug for DatagramReactor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramReactor")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex;
    use std::net::UdpSocket;
    use std::time::Instant;

    #[derive(Default)]
    struct Upper {
        calls: Mutex<Vec<&'static str>>,
    }

    impl DatagramHandler for Upper {
        fn handle_opened(&self, _datagram: &Datagram) {
            self.calls.lock().push("opened");
        }

        fn handle_closed(&self, _datagram: &Datagram) {
            self.calls.lock().push("closed");
        }

        fn handle_request(&self, datagram: &Datagram) -> Result<()> {
            self.calls.lock().push("request");
            if datagram.payload() == b"fail" {
                return Err(Error::new(ErrorKind::InvalidData));
            }
            datagram.send(&datagram.payload().to_ascii_uppercase())
        }
    }

    fn datagram(socket: &Arc<UdpSocket>, peer: &UdpSocket, payload: &[u8]) -> Datagram {
        Datagram::new(
            payload.to_vec(),
            Arc::clone(socket),
            peer.local_addr().expect("peer addr"),
        )
        .expect("datagram")
    }

    #[test]
    fn handles_each_datagram_once_in_order() {
        init_test_logging();
        crate::test_phase!("handles_each_datagram_once_in_order");
        let handler = Arc::new(Upper::default());
        let mut reactor = DatagramReactor::new(0, Arc::clone(&handler), Duration::from_millis(10));
        reactor.start().expect("start");

        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").expect("server"));
        let client = UdpSocket::bind("127.0.0.1:0").expect("client");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        let first = datagram(&server, &client, b"fail");
        let second = datagram(&server, &client, b"abc");
        let keys = vec![first.key(), second.key()];
        reactor.work_added(first);
        reactor.work_added(second);

        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert_eq!(removed, keys, "every datagram is released after handling");
        assert_eq!(reactor.queued(), 0);
        assert_eq!(
            *handler.calls.lock(),
            vec!["opened", "request", "closed", "opened", "request", "closed"]
        );

        let mut buf = [0u8; 8];
        let n = client.recv(&mut buf).expect("reply");
        assert_eq!(&buf[..n], b"ABC");
        reactor.stop();
        crate::test_complete!("handles_each_datagram_once_in_order");
    }

    #[test]
    fn idle_tick_is_bounded_and_wakeable() {
        init_test_logging();
        let handler = Arc::new(Upper::default());
        let mut reactor = DatagramReactor::new(0, handler, Duration::from_secs(10));
        reactor.start().expect("start");
        let waker = reactor.waker();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake()
        });
        let started = Instant::now();
        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert!(thread.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(removed.is_empty());
        reactor.stop();
        assert!(!reactor.waker().is_armed());
    }

    #[test]
    fn removal_drops_queued_datagram() {
        init_test_logging();
        let handler = Arc::new(Upper::default());
        let mut reactor = DatagramReactor::new(0, Arc::clone(&handler), Duration::from_millis(1));
        reactor.start().expect("start");
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").expect("server"));
        let client = UdpSocket::bind("127.0.0.1:0").expect("client");
        let item = datagram(&server, &client, b"x");
        let key = item.key();
        reactor.work_added(item);
        reactor.work_removed(&key);
        reactor.work_removed(&key);
        assert_eq!(reactor.queued(), 0);
        let mut removed = Vec::new();
        reactor.process(&mut removed);
        assert!(handler.calls.lock().is_empty());
    }
}
