//! Stop handshake between a service and its accept/receive loop.
//!
//! The service requests a stop and wakes the loop's poller; the loop notices
//! on its next iteration, closes its socket and acknowledges. The service
//! waits for the acknowledgement before joining the thread and stopping the
//! pool, so no work is inserted into a pool that is shutting down.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Phases of a service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopPhase {
    /// Accepting or receiving.
    Running = 0,
    /// Stop requested; the loop has not noticed yet.
    Stopping = 1,
    /// The loop has exited and released its socket.
    Stopped = 2,
}

impl LoopPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

struct SignalState {
    phase: AtomicU8,
    lock: Mutex<()>,
    stopped: Condvar,
}

/// Shared stop flag plus end-of-loop acknowledgement.
#[derive(Clone)]
pub struct StopSignal {
    state: Arc<SignalState>,
}

impl StopSignal {
    /// Creates a signal in the [`Running`](LoopPhase::Running) phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                phase: AtomicU8::new(LoopPhase::Running as u8),
                lock: Mutex::new(()),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    /// Returns `true` once a stop has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.phase() != LoopPhase::Running
    }

    /// Asks the loop to exit. Returns `false` if a stop was already requested.
    pub fn request_stop(&self) -> bool {
        self.state
            .phase
            .compare_exchange(
                LoopPhase::Running as u8,
                LoopPhase::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Called by the loop after it has released its socket.
    pub fn acknowledge(&self) {
        let _guard = self.state.lock.lock();
        self.state
            .phase
            .store(LoopPhase::Stopped as u8, Ordering::Release);
        self.state.stopped.notify_all();
    }

    /// Waits up to `timeout` for the acknowledgement. Returns `true` if it
    /// arrived.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while self.phase() != LoopPhase::Stopped {
            if self.state.stopped.wait_until(&mut guard, deadline).timed_out() {
                return self.phase() == LoopPhase::Stopped;
            }
        }
        true
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("phase", &self.phase())
            .finish()
    }
}
