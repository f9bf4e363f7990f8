//! Thread-per-task work pool.
//!
//! Every worker is an OS thread hosting one [`PoolTask`]. Work reaches a
//! worker through a lock-free inbox and a wake, so `insert_work` never blocks
//! on a busy task:
//!
//! ```text
//! insert_work ──▶ pick worker ──▶ inbox.push(Add) ──▶ waker.wake()
//!                                                         │
//!   worker loop: drain inbox ─▶ process(&mut removed) ◀───┘
//!                      ▲                 │
//!                      └── release keys ◀┘
//! ```
//!
//! # Scheduling
//!
//! - `round-robin` cycles through workers, skipping any at
//!   `max_work_per_thread`.
//! - `least-loaded` picks the worker with the fewest assigned units, lowest
//!   index first on ties.
//!
//! When no worker has room, an `elastic` pool spawns another worker up to
//! `max_threads`; otherwise the insert fails with `PoolSaturated`.
//!
//! # Shutdown
//!
//! `stop_tasks()` flags every worker, wakes it, and joins its thread. A worker
//! delivers whatever is left in its inbox, then calls the task's `stop()`, so
//! work inserted concurrently with shutdown is still released by its task.

use super::{PoolSpec, PoolTask, PoolWork, TaskFactory, WakeHandle, WorkPool, WorkPoolFactory};
use crate::config::{ThreadScheduling, WorkScheduling};
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, error, info, trace};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PoolState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

enum Command<W: PoolWork> {
    Add(W),
    Remove(W::Key),
}

struct Worker<W: PoolWork> {
    index: usize,
    inbox: SegQueue<Command<W>>,
    waker: WakeHandle,
    load: AtomicUsize,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<W: PoolWork> Worker<W> {
    fn drain_inbox<T: PoolTask<Work = W>>(&self, task: &mut T) {
        while let Some(command) = self.inbox.pop() {
            match command {
                Command::Add(work) => task.work_added(work),
                Command::Remove(key) => task.work_removed(&key),
            }
        }
    }

    fn signal_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = self.index, "pool worker panicked");
            }
        }
    }
}

struct Shared<W: PoolWork> {
    workers: Mutex<Vec<Arc<Worker<W>>>>,
    assignments: Mutex<HashMap<W::Key, usize>>,
}

impl<W: PoolWork> Shared<W> {
    /// Forgets keys a worker dropped on its own.
    fn release(&self, worker: &Worker<W>, keys: impl Iterator<Item = W::Key>) {
        let mut assignments = self.assignments.lock();
        for key in keys {
            if assignments.get(&key) == Some(&worker.index) {
                assignments.remove(&key);
                worker.load.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Forgets every key owned by a stopped worker.
    fn release_all(&self, worker: &Worker<W>) {
        self.assignments
            .lock()
            .retain(|_, owner| *owner != worker.index);
        worker.load.store(0, Ordering::Release);
    }
}

fn worker_loop<T: PoolTask>(mut task: T, worker: &Worker<T::Work>, shared: &Shared<T::Work>) {
    debug!(worker = worker.index, "pool worker started");
    let mut removed = Vec::new();
    while !worker.stopping.load(Ordering::Acquire) {
        worker.drain_inbox(&mut task);
        if worker.stopping.load(Ordering::Acquire) {
            break;
        }
        task.process(&mut removed);
        if !removed.is_empty() {
            trace!(worker = worker.index, count = removed.len(), "task released work");
            shared.release(worker, removed.drain(..));
        }
    }
    worker.drain_inbox(&mut task);
    task.stop();
    shared.release_all(worker);
    debug!(worker = worker.index, "pool worker stopped");
}

/// Work pool running each task on its own OS thread.
pub struct ThreadedWorkPool<T: PoolTask> {
    spec: PoolSpec,
    make_task: TaskFactory<T>,
    state: AtomicU8,
    cursor: AtomicUsize,
    shared: Arc<Shared<T::Work>>,
    lifecycle: Mutex<()>,
}

impl<T: PoolTask> ThreadedWorkPool<T> {
    /// Creates an unstarted pool.
    #[must_use]
    pub fn new(mut spec: PoolSpec, make_task: TaskFactory<T>) -> Self {
        spec.threads = spec.threads.max(1);
        spec.max_threads = spec.max_threads.max(spec.threads);
        Self {
            spec,
            make_task,
            state: AtomicU8::new(PoolState::Idle as u8),
            cursor: AtomicUsize::new(0),
            shared: Arc::new(Shared {
                workers: Mutex::new(Vec::new()),
                assignments: Mutex::new(HashMap::new()),
            }),
            lifecycle: Mutex::new(()),
        }
    }

    /// The pool's shape.
    #[must_use]
    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    /// Units assigned to each worker, by index.
    #[must_use]
    pub fn loads(&self) -> Vec<usize> {
        self.shared
            .workers
            .lock()
            .iter()
            .map(|w| w.load.load(Ordering::Acquire))
            .collect()
    }

    /// Index of the worker owning `key`.
    #[must_use]
    pub fn owner_of(&self, key: &<T::Work as PoolWork>::Key) -> Option<usize> {
        self.shared.assignments.lock().get(key).copied()
    }

    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            PoolState::Running => Ok(()),
            state => Err(Error::new(ErrorKind::PoolStopped)
                .with_message(format!("pool {} is {state:?}", self.spec.name))),
        }
    }

    fn spawn_worker(&self, index: usize) -> Result<Arc<Worker<T::Work>>> {
        let mut task = (self.make_task)(index);
        task.start()?;
        let worker = Arc::new(Worker {
            index,
            inbox: SegQueue::new(),
            waker: task.waker(),
            load: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        let thread_worker = Arc::clone(&worker);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{index}", self.spec.name))
            .spawn(move || worker_loop(task, &thread_worker, &shared))
            .map_err(|err| {
                Error::from(err).with_message(format!("failed to spawn worker {index}"))
            })?;
        *worker.thread.lock() = Some(handle);
        Ok(worker)
    }

    /// Picks a worker with room and reserves one unit on it.
    fn pick_worker(&self) -> Result<Arc<Worker<T::Work>>> {
        let mut workers = self.shared.workers.lock();
        let cap = self.spec.max_work_per_thread;
        let fits = |worker: &Worker<T::Work>| cap == 0 || worker.load.load(Ordering::Acquire) < cap;
        let count = workers.len();
        let chosen = if count == 0 {
            None
        } else {
            match self.spec.work_scheduling {
                WorkScheduling::RoundRobin => {
                    let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
                    (0..count)
                        .map(|offset| (start + offset) % count)
                        .find(|&i| fits(&workers[i]))
                }
                WorkScheduling::LeastLoaded => workers
                    .iter()
                    .filter(|w| fits(w))
                    .min_by_key(|w| (w.load.load(Ordering::Acquire), w.index))
                    .map(|w| w.index),
            }
        };
        let worker = match chosen {
            Some(index) => Arc::clone(&workers[index]),
            None if self.spec.thread_scheduling == ThreadScheduling::Elastic
                && count < self.spec.max_threads =>
            {
                let worker = self.spawn_worker(count)?;
                info!(pool = %self.spec.name, workers = count + 1, "pool grew");
                workers.push(Arc::clone(&worker));
                worker
            }
            None => {
                return Err(Error::new(ErrorKind::PoolSaturated).with_message(format!(
                    "all {count} workers of {} hold {cap} units",
                    self.spec.name
                )))
            }
        };
        worker.load.fetch_add(1, Ordering::AcqRel);
        Ok(worker)
    }
}

impl<T: PoolTask> WorkPool<T::Work> for ThreadedWorkPool<T> {
    fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if let Err(current) = self.state.compare_exchange(
            PoolState::Idle as u8,
            PoolState::Starting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::invalid_transition(
                PoolState::from_u8(current),
                PoolState::Running,
            ));
        }
        let mut started = Vec::with_capacity(self.spec.threads);
        for index in 0..self.spec.threads {
            match self.spawn_worker(index) {
                Ok(worker) => started.push(worker),
                Err(err) => {
                    error!(pool = %self.spec.name, worker = index, error = %err, "pool start failed");
                    for worker in &started {
                        worker.signal_stop();
                    }
                    for worker in &started {
                        worker.join();
                    }
                    self.state.store(PoolState::Stopped as u8, Ordering::Release);
                    return Err(err);
                }
            }
        }
        *self.shared.workers.lock() = started;
        self.state.store(PoolState::Running as u8, Ordering::Release);
        info!(
            pool = %self.spec.name,
            description = %self.spec.description,
            threads = self.spec.threads,
            "pool started"
        );
        Ok(())
    }

    fn insert_work(&self, work: T::Work) -> Result<()> {
        self.ensure_running()?;
        let key = work.key();
        let worker = self.pick_worker()?;
        let previous = self.shared.assignments.lock().insert(key.clone(), worker.index);
        if let Some(previous) = previous {
            debug!(key = ?key, previous, "work key reassigned");
        }
        trace!(key = ?key, worker = worker.index, "work inserted");
        worker.inbox.push(Command::Add(work));
        worker.waker.wake();
        Ok(())
    }

    fn remove_work(&self, key: &<T::Work as PoolWork>::Key) -> Result<bool> {
        self.ensure_running()?;
        let Some(index) = self.shared.assignments.lock().remove(key) else {
            return Ok(false);
        };
        let worker = self.shared.workers.lock().get(index).cloned();
        if let Some(worker) = worker {
            worker.load.fetch_sub(1, Ordering::AcqRel);
            worker.inbox.push(Command::Remove(key.clone()));
            worker.waker.wake();
        }
        Ok(true)
    }

    fn stop_tasks(&self) {
        let _lifecycle = self.lifecycle.lock();
        if self.state() == PoolState::Running {
            self.state.store(PoolState::Stopping as u8, Ordering::Release);
        }
        let workers = self.shared.workers.lock().clone();
        for worker in &workers {
            worker.signal_stop();
        }
        for worker in &workers {
            worker.join();
        }
    }

    fn stop(&self) {
        if self.state() == PoolState::Stopped {
            return;
        }
        self.stop_tasks();
        let _lifecycle = self.lifecycle.lock();
        self.shared.workers.lock().clear();
        self.shared.assignments.lock().clear();
        self.state.store(PoolState::Stopped as u8, Ordering::Release);
        info!(pool = %self.spec.name, "pool stopped");
    }

    fn work_count(&self) -> usize {
        self.shared.assignments.lock().len()
    }

    fn thread_count(&self) -> usize {
        self.shared
            .workers
            .lock()
            .iter()
            .filter(|w| w.thread.lock().is_some())
            .count()
    }
}

impl<T: PoolTask> Drop for ThreadedWorkPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: PoolTask> fmt::Debug for ThreadedWorkPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedWorkPool")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .field("workers", &self.shared.workers.lock().len())
            .field("assigned", &self.shared.assignments.lock().len())
            .finish()
    }
}

/// Factory for [`ThreadedWorkPool`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedPoolFactory;

impl WorkPoolFactory for ThreadedPoolFactory {
    fn create_pool<T: PoolTask>(
        &self,
        spec: PoolSpec,
        make_task: TaskFactory<T>,
    ) -> Result<Arc<dyn WorkPool<T::Work>>> {
        Ok(Arc::new(ThreadedWorkPool::new(spec, make_task)))
    }
}
