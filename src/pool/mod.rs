//! Work pools hosting long-lived tasks.
//!
//! A pool runs a set of [`PoolTask`]s, one per worker thread, and assigns
//! each inserted unit of work to exactly one of them. A task is long-lived:
//! its worker calls [`process`](PoolTask::process) in a loop, and between
//! calls delivers additions and removals that arrived from other threads.
//!
//! ```text
//!  insert_work ─▶ scheduler ─▶ worker inbox ─▶ work_added
//!                                    │
//!                       wake ────────┘    loop { process(&mut removed) }
//! ```
//!
//! The pool tracks which worker owns each key. Tasks report keys they drop
//! on their own through the `removed` buffer so that map stays exact.
//!
//! Pools are created through a [`WorkPoolFactory`] so services never name a
//! concrete implementation. [`ThreadedPoolFactory`] is the default.

pub mod threaded;
pub mod wake;

pub use threaded::{ThreadedPoolFactory, ThreadedWorkPool};
pub use wake::{Wake, WakeHandle, WakeSignal};

use crate::config::{PoolConfig, ThreadScheduling, WorkScheduling};
use crate::error::Result;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// A unit of work with a stable identity.
pub trait PoolWork: Send + 'static {
    /// Identity used for scheduling and removal.
    type Key: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static;

    /// Returns this work's key.
    fn key(&self) -> Self::Key;
}

/// Key type of a task's work.
pub type WorkKeyOf<T> = <<T as PoolTask>::Work as PoolWork>::Key;

/// A long-lived task driven by one pool worker.
///
/// Every method runs on the worker thread except [`start`](Self::start),
/// which the pool calls before handing the task to its thread, and
/// [`waker`](Self::waker), whose handle may be used from anywhere.
pub trait PoolTask: Send + 'static {
    /// Work this task accepts.
    type Work: PoolWork;

    /// Acquires the task's resources.
    ///
    /// # Errors
    ///
    /// Any failure aborts the pool start.
    fn start(&mut self) -> Result<()>;

    /// Releases everything the task still owns.
    fn stop(&mut self);

    /// Runs one bounded iteration, appending the key of every unit the task
    /// dropped on its own to `removed`.
    fn process(&mut self, removed: &mut Vec<WorkKeyOf<Self>>);

    /// Handle that makes a blocked [`process`](Self::process) return early.
    fn waker(&self) -> WakeHandle;

    /// Takes ownership of a new unit of work.
    fn work_added(&mut self, work: Self::Work);

    /// Drops the unit with `key`. Unknown keys are ignored.
    fn work_removed(&mut self, key: &WorkKeyOf<Self>);
}

/// Builds the task hosted by worker `index`.
pub type TaskFactory<T> = Arc<dyn Fn(usize) -> T + Send + Sync>;

/// Shape of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    /// Short name, used for thread names.
    pub name: String,
    /// Free-form description for logs.
    pub description: String,
    /// Workers started with the pool.
    pub threads: usize,
    /// Worker sizing policy.
    pub thread_scheduling: ThreadScheduling,
    /// Worker ceiling under [`ThreadScheduling::Elastic`].
    pub max_threads: usize,
    /// Units per worker; `0` means unlimited.
    pub max_work_per_thread: usize,
    /// Placement policy.
    pub work_scheduling: WorkScheduling,
}

impl PoolSpec {
    /// A fixed, unlimited, round-robin pool of `threads` workers.
    #[must_use]
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            name: name.into(),
            description: String::new(),
            threads,
            thread_scheduling: ThreadScheduling::Fixed,
            max_threads: threads,
            max_work_per_thread: 0,
            work_scheduling: WorkScheduling::RoundRobin,
        }
    }

    /// Builds a spec from pool configuration.
    #[must_use]
    pub fn from_config(name: impl Into<String>, config: &PoolConfig) -> Self {
        let mut config = config.clone();
        config.normalize();
        Self {
            name: name.into(),
            description: String::new(),
            threads: config.threads,
            thread_scheduling: config.thread_scheduling,
            max_threads: config.max_threads,
            max_work_per_thread: config.max_work_per_thread,
            work_scheduling: config.work_scheduling,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the per-worker cap.
    #[must_use]
    pub const fn max_work_per_thread(mut self, max: usize) -> Self {
        self.max_work_per_thread = max;
        self
    }

    /// Sets the placement policy.
    #[must_use]
    pub const fn work_scheduling(mut self, scheduling: WorkScheduling) -> Self {
        self.work_scheduling = scheduling;
        self
    }

    /// Lets the pool grow to `max_threads` workers under saturation.
    #[must_use]
    pub fn elastic(mut self, max_threads: usize) -> Self {
        self.thread_scheduling = ThreadScheduling::Elastic;
        self.max_threads = max_threads.max(self.threads);
        self
    }
}

/// A running set of tasks accepting work of type `W`.
pub trait WorkPool<W: PoolWork>: Send + Sync + fmt::Debug {
    /// Starts every task and its worker.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if already started; task start and thread
    /// spawn failures otherwise. Workers started before the failure are
    /// stopped again.
    fn start(&self) -> Result<()>;

    /// Assigns `work` to one task.
    ///
    /// # Errors
    ///
    /// `PoolStopped` unless running; `PoolSaturated` if every worker is at
    /// its cap and the pool cannot grow.
    fn insert_work(&self, work: W) -> Result<()>;

    /// Routes a removal to the task owning `key`. Returns `false` for
    /// unknown keys.
    ///
    /// # Errors
    ///
    /// `PoolStopped` unless running.
    fn remove_work(&self, key: &W::Key) -> Result<bool>;

    /// Stops every task and joins its worker.
    fn stop_tasks(&self);

    /// Stops the pool. Implies [`stop_tasks`](Self::stop_tasks). Idempotent.
    fn stop(&self);

    /// Units currently assigned.
    fn work_count(&self) -> usize;

    /// Live workers.
    fn thread_count(&self) -> usize;
}

/// Creates work pools.
pub trait WorkPoolFactory: Send + Sync + fmt::Debug + 'static {
    /// Creates an unstarted pool whose workers host tasks built by `make_task`.
    ///
    /// # Errors
    ///
    /// Invalid specs.
    fn create_pool<T: PoolTask>(
        &self,
        spec: PoolSpec,
        make_task: TaskFactory<T>,
    ) -> Result<Arc<dyn WorkPool<T::Work>>>;
}
