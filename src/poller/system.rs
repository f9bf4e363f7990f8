//! Native poller backed by the `polling` crate.
//!
//! `polling` selects the platform multiplexer at build time (epoll on Linux,
//! kqueue on macOS/BSD, IOCP on Windows, `poll(2)` elsewhere) and ships a
//! notifier that is part of every wait, which serves as the wake primitive.
//! Its registrations are one-shot, matching the [`Poller`] contract.

use super::{Event, Events, Interest, Poller, PollerFactory, Token};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use polling::{Event as PollEvent, Poller as RawPoller};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Registration state for a descriptor.
#[derive(Debug, Clone, Copy)]
struct RegistrationInfo {
    raw_fd: RawFd,
    interest: Interest,
}

/// Poller over the platform's native readiness API.
pub struct SystemPoller {
    poller: RawPoller,
    registrations: Mutex<HashMap<Token, RegistrationInfo>>,
}

impl SystemPoller {
    /// Creates a new poller.
    ///
    /// # Errors
    ///
    /// Returns an error if the multiplexer handle cannot be created
    /// (e.g. out of file descriptors).
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: RawPoller::new()?,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    fn to_poll_event(token: Token, interest: Interest) -> PollEvent {
        let key = token.0;
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }

    fn to_interest(event: &PollEvent) -> Interest {
        let mut interest = Interest::NONE;
        if event.readable {
            interest = interest.add(Interest::READABLE);
        }
        if event.writable {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }
}

impl Poller for SystemPoller {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        if regs.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        self.poller.add(fd, Self::to_poll_event(token, interest))?;
        regs.insert(
            token,
            RegistrationInfo {
                raw_fd: fd,
                interest,
            },
        );
        Ok(())
    }

    fn modify(&self, token: Token, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock();
        let info = regs
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        self.poller
            .modify(info.raw_fd, Self::to_poll_event(token, interest))?;
        info.interest = interest;
        Ok(())
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let info = self
            .registrations
            .lock()
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        self.poller.delete(info.raw_fd)
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let mut poll_events: Vec<PollEvent> = Vec::with_capacity(events.capacity().max(1));
        match self.poller.wait(&mut poll_events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }
        for poll_event in &poll_events {
            events.push(Event::new(
                Token(poll_event.key),
                Self::to_interest(poll_event),
            ));
        }
        trace!(ready = events.len(), "system poller returned");
        Ok(events.len())
    }

    fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }

    fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }
}

impl std::fmt::Debug for SystemPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemPoller")
            .field("registration_count", &self.registrations.lock().len())
            .finish_non_exhaustive()
    }
}

/// Factory for [`SystemPoller`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPollerFactory;

impl PollerFactory for SystemPollerFactory {
    fn create(&self) -> io::Result<Arc<dyn Poller>> {
        Ok(Arc::new(SystemPoller::new()?))
    }
}
