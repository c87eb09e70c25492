//! # Background Scheduler
//!
//! One worker thread runs queued tasks strictly one at a time, in FIFO order.
//! When the queue is empty the worker sleeps in short steps; once it has been
//! idle for `cron_interval`, every registered periodic task is enqueued once.
//!
//! ```text
//!   enqueue(task) ──► [ t1 | t2 | ... | tN ]  (N ≤ queue_capacity)
//!        │                    │
//!        │ queue full         ▼
//!        │              sqlite-rw-scheduler thread
//!        ▼                    │ empty: sleep idle_poll
//!   run inline on caller      │ idle ≥ cron_interval:
//!                             └──► enqueue each periodic task
//! ```
//!
//! ## Back-Pressure
//!
//! A full queue never drops work and never blocks waiting for room: the task
//! runs on the caller's thread before `enqueue` returns. Writers that outrun
//! replication end up replicating in line, which slows them to the speed of
//! the replica.
//!
//! ## Failures
//!
//! A task that returns `Err` is logged (`warn` when retryable, `error`
//! otherwise). A task that panics is caught and logged. Either way the worker
//! moves on to the next task.
//!
//! ## Lifecycle
//!
//! [`Scheduler::start`] spawns the worker and returns the owner. Components
//! receive a cloneable [`SchedulerHandle`]. [`Scheduler::shutdown`] (or drop)
//! stops the worker after it has drained the queue; from then on `enqueue`
//! runs every task inline.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::replicator::ReplicationLock;

/// A one-shot task.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A task that fires every time the worker has been idle long enough.
pub type PeriodicTask = Arc<dyn Fn() -> Result<()> + Send + Sync + 'static>;

struct Periodic {
    task: PeriodicTask,
    /// Live [`PeriodicRegistration`]s for this key. Zero for tasks added
    /// with [`SchedulerHandle::register_periodic`].
    holders: usize,
}

/// Where an enqueued task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued for the worker.
    Queued,
    /// Run on the caller's thread because the queue was full.
    InlineFull,
    /// Run on the caller's thread because the scheduler has stopped.
    InlineStopped,
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    periodic: Mutex<BTreeMap<String, Periodic>>,
    /// Only written while holding `queue`, so a task is either queued before
    /// the worker's final drain or run inline, never lost.
    running: AtomicBool,
    capacity: usize,
    replication_lock: ReplicationLock,
}

enum Next {
    Run(Task),
    Idle,
    Exit,
}

impl Shared {
    // The queue and registry hold boxed closures only; a panic elsewhere
    // cannot corrupt them, so poisoning is ignored.
    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn periodic(&self) -> MutexGuard<'_, BTreeMap<String, Periodic>> {
        self.periodic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, task: Task) -> Dispatch {
        let rejected = {
            let mut queue = self.queue();
            if !self.running.load(Ordering::Acquire) {
                Some((task, Dispatch::InlineStopped))
            } else if queue.len() >= self.capacity {
                Some((task, Dispatch::InlineFull))
            } else {
                queue.push_back(task);
                None
            }
        };

        match rejected {
            None => Dispatch::Queued,
            Some((task, dispatch)) => {
                if dispatch == Dispatch::InlineFull {
                    tracing::debug!(capacity = self.capacity, "scheduler queue full, running task inline");
                }
                run_task(task);
                dispatch
            }
        }
    }

    fn next(&self) -> Next {
        let mut queue = self.queue();
        match queue.pop_front() {
            Some(task) => Next::Run(task),
            None if self.running.load(Ordering::Acquire) => Next::Idle,
            None => Next::Exit,
        }
    }

    fn fire_periodic(&self) {
        let tasks: Vec<(String, PeriodicTask)> = self
            .periodic()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(&entry.task)))
            .collect();

        for (key, task) in tasks {
            tracing::trace!(%key, "enqueueing periodic task");
            self.enqueue(Box::new(move || task()));
        }
    }

    fn stop(&self) {
        let _queue = self.queue();
        self.running.store(false, Ordering::Release);
    }
}

/// Runs a task, logging failures and containing panics.
fn run_task(task: Task) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_retryable() => tracing::warn!(error = %e, "scheduled task failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "scheduled task failed"),
        Err(payload) => {
            tracing::error!(panic = %panic_message(payload.as_ref()), "scheduled task panicked")
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// =============================================================================
// Worker
// =============================================================================

fn run_worker(shared: Arc<Shared>, cron_interval: Duration, idle_poll: Duration) {
    let mut idle_since = Instant::now();

    loop {
        match shared.next() {
            Next::Run(task) => {
                run_task(task);
                idle_since = Instant::now();
            }
            Next::Idle => {
                thread::sleep(idle_poll);
                if idle_since.elapsed() >= cron_interval {
                    shared.fire_periodic();
                    idle_since = Instant::now();
                }
            }
            Next::Exit => break,
        }
    }

    tracing::debug!("scheduler worker stopped");
}

// =============================================================================
// Public API
// =============================================================================

/// Cloneable access to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("running", &self.is_running())
            .field("queue_len", &self.queue_len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl SchedulerHandle {
    /// Queues `task`, or runs it before returning when the queue is full or
    /// the scheduler has stopped.
    pub fn enqueue(&self, task: impl FnOnce() -> Result<()> + Send + 'static) -> Dispatch {
        self.shared.enqueue(Box::new(task))
    }

    /// Registers `task` under `key`, replacing any task already there.
    /// Returns true if a task was replaced.
    pub fn register_periodic(
        &self,
        key: impl Into<String>,
        task: impl Fn() -> Result<()> + Send + Sync + 'static,
    ) -> bool {
        let key = key.into();
        let replaced = self.upsert_periodic(&key, Arc::new(task), 0);
        tracing::debug!(%key, replaced, "registered periodic task");
        replaced
    }

    /// Like [`register_periodic`](Self::register_periodic), but the task
    /// stays registered only while a returned [`PeriodicRegistration`] for
    /// `key` is alive. Registrations for one key are counted; the newest
    /// task wins.
    pub fn acquire_periodic(
        &self,
        key: impl Into<String>,
        task: impl Fn() -> Result<()> + Send + Sync + 'static,
    ) -> PeriodicRegistration {
        let key = key.into();
        self.upsert_periodic(&key, Arc::new(task), 1);
        tracing::debug!(%key, "acquired periodic task");
        PeriodicRegistration {
            key,
            handle: self.clone(),
        }
    }

    fn upsert_periodic(&self, key: &str, task: PeriodicTask, holders: usize) -> bool {
        let mut periodic = self.shared.periodic();
        match periodic.get_mut(key) {
            Some(entry) => {
                entry.task = task;
                entry.holders += holders;
                true
            }
            None => {
                periodic.insert(key.to_string(), Periodic { task, holders });
                false
            }
        }
    }

    /// Removes the periodic task under `key` regardless of registrations.
    /// Returns true if one existed.
    pub fn unregister_periodic(&self, key: &str) -> bool {
        self.shared.periodic().remove(key).is_some()
    }

    /// Keys of the registered periodic tasks, sorted.
    pub fn periodic_keys(&self) -> Vec<String> {
        self.shared.periodic().keys().cloned().collect()
    }

    /// Tasks currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The lock shared by every replicator using this scheduler.
    pub fn replication_lock(&self) -> ReplicationLock {
        self.shared.replication_lock.clone()
    }
}

/// Keeps an acquired periodic task registered. The task is removed when the
/// last registration for its key is dropped.
#[derive(Debug)]
pub struct PeriodicRegistration {
    key: String,
    handle: SchedulerHandle,
}

impl PeriodicRegistration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PeriodicRegistration {
    fn drop(&mut self) {
        let mut periodic = self.handle.shared.periodic();
        let Some(entry) = periodic.get_mut(&self.key) else {
            return;
        };
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            periodic.remove(&self.key);
            tracing::debug!(key = %self.key, "released periodic task");
        }
    }
}

/// Owner of the background worker thread.
///
/// # Example
///
/// ```rust
/// use sqlite_rw::{Scheduler, SchedulerConfig};
///
/// let scheduler = Scheduler::start(SchedulerConfig::default())?;
/// let handle = scheduler.handle();
/// handle.enqueue(|| Ok(()));
/// scheduler.shutdown();
/// # Ok::<(), sqlite_rw::Error>(())
/// ```
#[derive(Debug)]
pub struct Scheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Validates `config` and spawns the `sqlite-rw-scheduler` thread.
    pub fn start(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            periodic: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(true),
            capacity: config.queue_capacity,
            replication_lock: ReplicationLock::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let (cron_interval, idle_poll) = (config.cron_interval(), config.idle_poll());
        let thread = thread::Builder::new()
            .name("sqlite-rw-scheduler".to_string())
            .spawn(move || run_worker(worker_shared, cron_interval, idle_poll))?;

        tracing::debug!(
            capacity = config.queue_capacity,
            cron_interval_ms = config.cron_interval_ms,
            "scheduler started"
        );

        Ok(Self {
            handle: SchedulerHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stops the worker once it has run everything already queued, then
    /// joins it.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.shared.stop();
        if thread.join().is_err() {
            tracing::error!("scheduler worker panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

// =============================================================================
// Tests
// =============================================================================
