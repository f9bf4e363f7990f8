//! Cross-thread wake handles.

use crate::tracing_compat::trace;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Something that can interrupt a blocked `process()` call.
pub trait Wake: Send + Sync {
    /// Signals the target. Must be cheap and safe from any thread.
    ///
    /// # Errors
    ///
    /// Platform errors from the underlying primitive.
    fn wake(&self) -> io::Result<()>;
}

/// Shared slot holding a task's current wake target.
///
/// A task publishes its target in `start()` and retracts it in `stop()`.
/// Waking an empty handle does nothing, so inserting work into a stopped
/// task never touches a released primitive.
#[derive(Clone, Default)]
pub struct WakeHandle {
    target: Arc<Mutex<Option<Arc<dyn Wake>>>>,
}

impl WakeHandle {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `target`, replacing any previous one.
    pub fn publish(&self, target: Arc<dyn Wake>) {
        *self.target.lock() = Some(target);
    }

    /// Clears the target.
    pub fn retract(&self) {
        self.target.lock().take();
    }

    /// Returns `true` while a target is installed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.target.lock().is_some()
    }

    /// Wakes the target, if any. Returns `false` when nothing was installed.
    ///
    /// Signal failures are logged and reported as `false`.
    pub fn wake(&self) -> bool {
        let target = self.target.lock().clone();
        match target {
            Some(target) => match target.wake() {
                Ok(()) => true,
                Err(err) => {
                    trace!(error = %err, "wake failed");
                    false
                }
            },
            None => false,
        }
    }
}

impl fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Condition-variable wake target for tasks that do not own a poller.
///
/// A wake that arrives while nobody waits is remembered, so the next
/// [`wait`](Self::wait) returns immediately.
#[derive(Debug, Default)]
pub struct WakeSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    /// Creates an unsignalled instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until woken or `timeout` elapses. Returns `true` if woken.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.cond.wait_for(&mut woken, timeout);
        }
        std::mem::replace(&mut *woken, false)
    }
}

impl Wake for WakeSignal {
    fn wake(&self) -> io::Result<()> {
        *self.woken.lock() = true;
        self.cond.notify_all();
        Ok(())
    }
}
