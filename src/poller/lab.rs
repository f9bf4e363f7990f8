//! Virtual poller for deterministic tests.
//!
//! [`LabPoller`] never touches the OS multiplexer. Test code marks tokens
//! ready with [`set_ready`](LabPoller::set_ready); `poll()` delivers pending
//! readiness for armed registrations, honouring the same one-shot contract as
//! the system poller, and blocks on a condition variable otherwise so
//! [`wake`](Poller::wake) behaves like the real thing.
//!
//! ```ignore
//! let poller = LabPoller::new();
//! poller.register(fd, Token::new(1), Interest::READABLE)?;
//! poller.set_ready(Token::new(1), Interest::READABLE);
//!
//! let mut events = Events::with_capacity(8);
//! assert_eq!(poller.poll(&mut events, Some(Duration::ZERO))?, 1);
//! ```

use super::{Event, Events, Interest, Poller, PollerFactory, Token};
use crate::tracing_compat::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct LabRegistration {
    raw_fd: RawFd,
    interest: Interest,
    armed: bool,
}

#[derive(Debug, Default)]
struct LabState {
    registrations: HashMap<Token, LabRegistration>,
    /// Readiness waiting to be delivered, ordered by token for determinism.
    pending: BTreeMap<Token, Interest>,
    woken: bool,
    wake_count: u64,
    poll_count: u64,
}

impl LabState {
    fn drain_ready(&mut self, events: &mut Events) {
        let deliverable: Vec<Token> = self
            .pending
            .keys()
            .copied()
            .filter(|token| {
                self.registrations
                    .get(token)
                    .is_some_and(|reg| reg.armed)
            })
            .collect();
        for token in deliverable {
            let Some(ready) = self.pending.remove(&token) else {
                continue;
            };
            let Some(reg) = self.registrations.get_mut(&token) else {
                continue;
            };
            let fired = Interest::NONE
                .add(if ready.is_readable() && reg.interest.is_readable() {
                    Interest::READABLE
                } else {
                    Interest::NONE
                })
                .add(if ready.is_writable() && reg.interest.is_writable() {
                    Interest::WRITABLE
                } else {
                    Interest::NONE
                });
            if fired.is_empty() {
                continue;
            }
            reg.armed = false;
            events.push(Event::new(token, fired));
        }
    }
}

/// Virtual poller with injected readiness.
#[derive(Debug, Default)]
pub struct LabPoller {
    state: Mutex<LabState>,
    cond: Condvar,
}

impl LabPoller {
    /// Creates an empty lab poller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `token` ready. Delivered by the next poll once the registration is armed.
    pub fn set_ready(&self, token: Token, ready: Interest) {
        let mut state = self.state.lock();
        let entry = state.pending.entry(token).or_insert(Interest::NONE);
        *entry = entry.add(ready);
        drop(state);
        self.cond.notify_all();
    }

    /// Returns how many times [`wake`](Poller::wake) was called.
    #[must_use]
    pub fn wake_count(&self) -> u64 {
        self.state.lock().wake_count
    }

    /// Returns how many polls have completed.
    #[must_use]
    pub fn poll_count(&self) -> u64 {
        self.state.lock().poll_count
    }

    /// Returns the descriptor registered under `token`.
    #[must_use]
    pub fn registered_fd(&self, token: Token) -> Option<RawFd> {
        self.state
            .lock()
            .registrations
            .get(&token)
            .map(|reg| reg.raw_fd)
    }
}

impl Poller for LabPoller {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.registrations.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        state.registrations.insert(
            token,
            LabRegistration {
                raw_fd: fd,
                interest,
                armed: true,
            },
        );
        Ok(())
    }

    fn modify(&self, token: Token, interest: Interest) -> io::Result<()> {
        let mut state = self.state.lock();
        let reg = state
            .registrations
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        reg.interest = interest;
        reg.armed = true;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        state
            .registrations
            .remove(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;
        state.pending.remove(&token);
        Ok(())
    }

    fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            state.drain_ready(events);
            if !events.is_empty() || state.woken {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        state.drain_ready(events);
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        if state.woken {
            debug!("lab poller woken");
        }
        state.woken = false;
        state.poll_count += 1;
        Ok(events.len())
    }

    fn wake(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.woken = true;
        state.wake_count += 1;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }
}

/// Factory handing out [`LabPoller`]s and keeping them for test inspection.
#[derive(Debug, Default)]
pub struct LabPollerFactory {
    created: Mutex<Vec<Arc<LabPoller>>>,
}

impl LabPollerFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every poller created so far, in creation order.
    #[must_use]
    pub fn pollers(&self) -> Vec<Arc<LabPoller>> {
        self.created.lock().clone()
    }
}

impl PollerFactory for LabPollerFactory {
    fn create(&self) -> io::Result<Arc<dyn Poller>> {
        let poller = Arc::new(LabPoller::new());
        self.created.lock().push(Arc::clone(&poller));
        Ok(poller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn delivers_injected_readiness_once() {
        let poller = LabPoller::new();
        let token = Token::new(1);
        poller.register(10, token, Interest::READABLE).expect("register");
        poller.set_ready(token, Interest::READABLE);

        let mut events = Events::with_capacity(4);
        assert_eq!(poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"), 1);

        poller.set_ready(token, Interest::READABLE);
        assert_eq!(
            poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"),
            0,
            "disarmed until modify"
        );
        poller.modify(token, Interest::READABLE).expect("modify");
        assert_eq!(poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"), 1);
    }

    #[test]
    fn delivers_all_ready_tokens_beyond_capacity() {
        let poller = LabPoller::new();
        for (fd, id) in [(20, 1), (21, 2), (22, 3)] {
            poller
                .register(fd, Token::new(id), Interest::READABLE)
                .expect("register");
            poller.set_ready(Token::new(id), Interest::READABLE);
        }
        let mut events = Events::with_capacity(1);
        assert_eq!(poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"), 3);
        let tokens: Vec<usize> = events.iter().map(|e| e.token.0).collect();
        assert_eq!(tokens, vec![1, 2, 3]);
    }

    #[test]
    fn ignores_unregistered_and_uninterested_tokens() {
        let poller = LabPoller::new();
        poller
            .register(11, Token::new(2), Interest::READABLE)
            .expect("register");
        poller.set_ready(Token::new(99), Interest::READABLE);
        poller.set_ready(Token::new(2), Interest::WRITABLE);
        let mut events = Events::with_capacity(4);
        assert_eq!(poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"), 0);
    }

    #[test]
    fn wake_unblocks_poll_without_events() {
        let poller = Arc::new(LabPoller::new());
        let waker = Arc::clone(&poller);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().expect("wake");
        });
        let started = Instant::now();
        let mut events = Events::with_capacity(4);
        let n = poller.poll(&mut events, Some(Duration::from_secs(10))).expect("poll");
        handle.join().expect("join");
        assert_eq!(n, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(poller.wake_count(), 1);
    }

    #[test]
    fn deregister_drops_pending_readiness() {
        let poller = LabPoller::new();
        let token = Token::new(5);
        poller.register(12, token, Interest::READABLE).expect("register");
        poller.set_ready(token, Interest::READABLE);
        poller.deregister(token).expect("deregister");
        poller.register(13, token, Interest::READABLE).expect("re-register");
        assert_eq!(poller.registered_fd(token), Some(13));
        let mut events = Events::with_capacity(4);
        assert_eq!(poller.poll(&mut events, Some(Duration::ZERO)).expect("poll"), 0);
    }
}
