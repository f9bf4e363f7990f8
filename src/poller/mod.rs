//! Readiness multiplexing for connection reactors.
//!
//! Every [`ConnectionReactor`](crate::reactor::ConnectionReactor) owns a private
//! [`Poller`]. The poller is the whole multiplexer contract the reactor relies
//! on:
//!
//! - register/modify/deregister descriptors under a [`Token`];
//! - wait for readiness, bounded by a timeout;
//! - [`wake`](Poller::wake) a pending wait from any other thread.
//!
//! The wake primitive is owned by the poller and is always part of the waited
//! set. A wake makes `poll()` return early but never shows up as an [`Event`].
//!
//! # Backends
//!
//! | Backend | Type | Notes |
//! |---------|------|-------|
//! | epoll / kqueue / IOCP / poll(2) | [`SystemPoller`] | chosen by the `polling` crate for the target platform |
//! | virtual | [`LabPoller`] | readiness injected by tests |
//!
//! The backend is picked once through a [`PollerFactory`]; reactor code never
//! branches on it.
//!
//! # One-shot delivery
//!
//! Registrations are one-shot: once an event for a token has been returned by
//! `poll()`, that token stays silent until [`modify`](Poller::modify) re-arms
//! it. The reactor re-arms a connection after its handler asked to keep it
//! open, so a connection is never dispatched twice concurrently.
//!
//! ```ignore
//! let poller = SystemPoller::new()?;
//! poller.register(stream.as_raw_fd(), Token::new(7), Interest::READABLE)?;
//!
//! let mut events = Events::with_capacity(64);
//! poller.poll(&mut events, Some(Duration::from_millis(100)))?;
//! for event in &events {
//!     // handle event.token, then re-arm
//!     poller.modify(event.token, Interest::READABLE)?;
//! }
//! ```

pub mod interest;
pub mod lab;
pub mod system;

pub use interest::Interest;
pub use lab::{LabPoller, LabPollerFactory};
pub use system::{SystemPoller, SystemPollerFactory};

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token identifying a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl Token {
    /// Creates a new token.
    #[must_use]
    pub const fn new(val: usize) -> Self {
        Self(val)
    }
}

/// Readiness notification for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token identifying the registration.
    pub token: Token,
    /// Readiness flags that triggered.
    pub ready: Interest,
}

impl Event {
    /// Creates a new event with specified token and readiness flags.
    #[must_use]
    pub const fn new(token: Token, ready: Interest) -> Self {
        Self { token, ready }
    }

    /// Creates a readable event.
    #[must_use]
    pub const fn readable(token: Token) -> Self {
        Self::new(token, Interest::READABLE)
    }

    /// Returns true if the descriptor is readable.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }

    /// Returns true if the descriptor is writable.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.ready.is_writable()
    }
}

/// Container for events returned by [`Poller::poll`].
///
/// Re-use across polls to avoid allocation. Registrations are one-shot, so a
/// poll keeps every event it collects: one left behind would stay disarmed.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Creates a new events buffer sized for `capacity` events.
    ///
    /// The buffer grows when a poll returns more.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Clears all events, maintaining capacity.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Pushes an event, growing past the initial capacity if needed.
    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    /// Returns the number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no events are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the initial capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Readiness multiplexer with a built-in cross-thread wake primitive.
///
/// Implementations use interior mutability and are shared as
/// `Arc<dyn Poller>`: the owning reactor polls, other threads only call
/// [`wake`](Self::wake).
pub trait Poller: Send + Sync + fmt::Debug {
    /// Registers `fd` under `token` with the given interest.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the token is already registered
    /// - platform errors from the underlying multiplexer
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Changes the interest of a registration and re-arms it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the token is not registered.
    fn modify(&self, token: Token, interest: Interest) -> io::Result<()>;

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// `NotFound` if the token is not registered.
    fn deregister(&self, token: Token) -> io::Result<()>;

    /// Waits for readiness, blocking up to `timeout` (`None` blocks until an
    /// event or a wake). Returns the number of events placed in `events`.
    ///
    /// # Errors
    ///
    /// Platform errors from the underlying wait.
    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;

    /// Wakes a pending or the next [`poll`](Self::poll) call. Safe from any thread.
    ///
    /// # Errors
    ///
    /// Platform errors from signalling the wake primitive.
    fn wake(&self) -> io::Result<()>;

    /// Returns the number of active registrations.
    fn registration_count(&self) -> usize;

    /// Returns `true` if nothing is registered.
    fn is_empty(&self) -> bool {
        self.registration_count() == 0
    }
}

/// Creates pollers for reactors.
///
/// Each reactor calls [`create`](Self::create) once from its `start()`.
pub trait PollerFactory: Send + Sync + fmt::Debug {
    /// Creates a fresh poller with its own wake primitive.
    ///
    /// # Errors
    ///
    /// Propagates failures creating the multiplexer handle.
    fn create(&self) -> io::Result<Arc<dyn Poller>>;
}

/// Returns the factory for the platform's native multiplexer.
#[must_use]
pub fn default_poller_factory() -> Arc<dyn PollerFactory> {
    Arc::new(SystemPollerFactory)
}
