//! # Work-Stealing Task Scheduler
//!
//! N:M executor that drives fiber mailboxes on a pool of worker threads.
//!
//! ## Design
//!
//! - Every worker thread owns a local deque
//! - A global injector receives work submitted from outside the pool
//! - Idle workers steal from the injector, then from siblings
//! - Idle workers park on a condition variable instead of spinning
//!
//! A task is one drain of a fiber mailbox. Fibers reschedule themselves by
//! submitting a new drain when they yield, so the scheduler never needs to
//! know what a fiber is.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::cause::Defect;
use crate::config::SchedulerConfig;

/// A unit of work.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Something that runs tasks.
pub(crate) trait Executor: Send + Sync {
    /// Queue a task for execution.
    fn submit(&self, task: Task);
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

struct LocalQueue {
    scheduler: u64,
    deque: Deque<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// State shared between the scheduler handle and its workers.
struct Shared {
    /// Distinguishes schedulers when several runtimes share a process.
    id: u64,
    /// Global injection queue.
    global_queue: Injector<Task>,
    /// Stealers for work-stealing.
    stealers: Vec<Stealer<Task>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of active workers.
    active_workers: AtomicUsize,
    /// Number of parked workers.
    idle: Mutex<usize>,
    /// Wakes parked workers.
    wakeup: Condvar,
    /// Tasks submitted since start.
    submitted: AtomicU64,
    /// Tasks completed since start.
    completed: AtomicU64,
    /// Tasks taken from another worker's deque.
    stolen: AtomicU64,
    /// How long an idle worker parks.
    park_timeout: Duration,
    /// Whether workers steal from each other.
    work_stealing: bool,
}

impl Shared {
    fn notify_one(&self) {
        let idle = self.idle.lock();
        if *idle > 0 {
            self.wakeup.notify_one();
        }
    }
}

/// Work-stealing scheduler.
pub struct Scheduler {
    shared: Arc<Shared>,
    /// Worker threads.
    workers: Mutex<Vec<WorkerHandle>>,
    num_workers: usize,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks submitted since start.
    pub submitted: u64,
    /// Tasks completed since start.
    pub completed: u64,
    /// Tasks taken from another worker's deque.
    pub stolen: u64,
    /// Workers currently running their loop.
    pub active_workers: usize,
}

impl Scheduler {
    /// Start a scheduler with the given configuration.
    pub fn start(config: &SchedulerConfig) -> io::Result<Self> {
        let num_workers = config.num_workers.max(1);

        // Create worker deques and collect stealers
        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            global_queue: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle: Mutex::new(0),
            wakeup: Condvar::new(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
            park_timeout: config.idle_park_timeout,
            work_stealing: config.work_stealing,
        });

        let scheduler = Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            num_workers,
        };

        for (i, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id: i,
                shared: shared.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("tessel-worker-{}", i))
                .spawn(move || worker.run_loop(deque));
            match spawned {
                Ok(handle) => scheduler.workers.lock().push(WorkerHandle {
                    id: i,
                    thread: Some(handle),
                }),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Stop all workers and wait for them to exit.
    ///
    /// Tasks still queued are dropped. Calling this from a worker thread
    /// skips joining that thread.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _idle = self.shared.idle.lock();
            self.shared.wakeup.notify_all();
        }

        let current = thread::current().id();
        let handles: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        for mut worker in handles {
            if let Some(handle) = worker.thread.take() {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    tracing::error!(worker = worker.id, "worker thread panicked");
                }
            }
        }
        tracing::debug!("scheduler stopped");
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            stolen: self.shared.stolen.load(Ordering::Relaxed),
            active_workers: self.shared.active_workers.load(Ordering::Relaxed),
        }
    }
}

impl Executor for Scheduler {
    fn submit(&self, task: Task) {
        if self.is_shutting_down() {
            return;
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        // Workers of this scheduler keep their own fibers local.
        let task = LOCAL.with(|local| match &*local.borrow() {
            Some(queue) if queue.scheduler == self.shared.id && self.shared.work_stealing => {
                queue.deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = task {
            self.shared.global_queue.push(task);
        }
        self.shared.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a worker thread.
struct WorkerHandle {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

/// A worker thread in the scheduler.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, local: Deque<Task>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        LOCAL.with(|slot| {
            *slot.borrow_mut() = Some(LocalQueue {
                scheduler: self.shared.id,
                deque: local,
            })
        });

        loop {
            // Check for shutdown
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Try to get work
            match self.find_work() {
                Some(task) => self.run_task(task),
                None => self.park(),
            }
        }

        LOCAL.with(|slot| slot.borrow_mut().take());
        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(worker = self.id, "worker exited");
    }

    /// Find work using work-stealing.
    fn find_work(&self) -> Option<Task> {
        // 1. Try local queue first
        let local = LOCAL.with(|slot| slot.borrow().as_ref().and_then(|q| q.deque.pop()));
        if local.is_some() {
            return local;
        }

        // 2. Try global queue
        loop {
            match self.shared.global_queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if !self.shared.work_stealing {
            return None;
        }

        // 3. Try stealing from other workers
        for (i, stealer) in self.shared.stealers.iter().enumerate() {
            if i == self.id {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => {
                        self.shared.stolen.fetch_add(1, Ordering::Relaxed);
                        return Some(task);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Run one task, containing any panic it raises.
    fn run_task(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let defect = Defect::from_panic(payload);
            tracing::error!(worker = self.id, %defect, "task panicked");
        }
        self.shared.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Park until work is submitted or the timeout elapses.
    fn park(&self) {
        let mut idle = self.shared.idle.lock();
        if !self.shared.global_queue.is_empty() || self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        *idle += 1;
        self.shared
            .wakeup
            .wait_for(&mut idle, self.shared.park_timeout);
        *idle -= 1;
    }
}

/// Executor that queues tasks and runs them on the calling thread.
///
/// Backs [`Runtime::run_sync`](crate::Runtime::run_sync).
#[derive(Default)]
pub(crate) struct SyncExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl SyncExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks until the queue is empty.
    pub(crate) fn flush(&self) {
        loop {
            let task = self.queue.lock().pop_front();
            match task {
                Some(task) => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        let defect = Defect::from_panic(payload);
                        tracing::error!(%defect, "task panicked");
                    }
                }
                None => break,
            }
        }
    }
}

impl Executor for SyncExecutor {
    fn submit(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

// ============================================================================
// Tests
// ============================================================================
