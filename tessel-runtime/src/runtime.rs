//! # Runtime
//!
//! A [`Runtime`] owns the worker pool, the timer thread and the registry of
//! root fibers. Effects are descriptions; a runtime executes them through
//! one of its entry points:
//!
//! | Entry point | Returns |
//! |-------------|---------|
//! | [`Runtime::run_fork`] | a [`Fiber`] handle |
//! | [`Runtime::run_promise`] | a [`Promise`] resolving to `Result<A, FiberFailure<E>>` |
//! | [`Runtime::run_promise_exit`] | a [`PromiseExit`] resolving to the full [`Exit`] |
//! | [`Runtime::run_callback`] | nothing; the callback receives the exit |
//! | [`Runtime::run_sync`] / [`Runtime::run_sync_exit`] | the result, computed on the calling thread |
//!
//! ## Lifecycle
//!
//! `shutdown` interrupts every root fiber, waits up to the configured
//! graceful timeout for them to finish, then stops the timer and the
//! workers. Dropping a runtime shuts it down.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::{Effect, Runtime};
//!
//! let rt = Runtime::builder().num_workers(4).build()?;
//! let answer = rt.run_promise(Effect::<i32>::succeed(42)).wait()?;
//! rt.shutdown();
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::cause::Cause;
use crate::config::{ConfigError, RuntimeConfig};
use crate::effect::{Effect, Op};
use crate::error::FiberFailure;
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, typed_exit, Fiber, FiberId};
use crate::fiber_ref::FiberRefs;
use crate::fiber_runtime::{FiberRuntime, Observer};
use crate::log::{LogEntry, LogLevel, Logger, TracingLogger, CURRENT_LOG_LEVEL};
use crate::observability::{RuntimeStats, StatsCounters, Supervisor, Tracer, TracingTracer};
use crate::scheduler::{Executor, Scheduler, SyncExecutor};
use crate::timer::Timer;
use crate::value::{Data, Value};

/// Errors starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker or timer thread could not be spawned.
    #[error("failed to spawn runtime thread: {0}")]
    Spawn(#[from] io::Error),
}

/// State shared by a runtime and every fiber it runs.
pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) timer: Arc<Timer>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) tracer: Arc<dyn Tracer>,
    supervisors: Vec<Arc<dyn Supervisor>>,
    roots: Mutex<HashMap<u64, Arc<FiberRuntime>>>,
    roots_drained: Condvar,
    stats: StatsCounters,
    started: Instant,
    shutdown: AtomicBool,
}

impl RuntimeInner {
    pub(crate) fn add_root(&self, fiber: Arc<FiberRuntime>) {
        if fiber.is_done() {
            return;
        }
        self.roots.lock().insert(fiber.key(), fiber);
    }

    pub(crate) fn remove_root(&self, key: u64) {
        let mut roots = self.roots.lock();
        if roots.remove(&key).is_some() && roots.is_empty() {
            self.roots_drained.notify_all();
        }
    }

    pub(crate) fn on_fiber_start(&self, fiber: &Arc<FiberRuntime>) {
        self.stats.record_start();
        for supervisor in &self.supervisors {
            supervisor.on_start(fiber.id(), fiber.parent_id());
        }
    }

    /// Record a finished fiber and report defects.
    ///
    /// A defect nobody is waiting for is logged at the configured defect
    /// level; an observed one only at debug.
    pub(crate) fn on_fiber_end(&self, fiber: &FiberRuntime, exit: &Exit<Value, Value>, observed: bool) {
        self.stats.record_end(exit);
        if !self.supervisors.is_empty() {
            let shape = exit.as_unit();
            for supervisor in &self.supervisors {
                supervisor.on_end(fiber.id(), &shape);
            }
        }
        if let Exit::Failure(cause) = exit {
            if cause.defects().is_empty() {
                return;
            }
            let level = if observed {
                LogLevel::Debug
            } else {
                self.config.log.defect_level
            };
            if level.enabled_at(self.config.log.level) {
                let entry = LogEntry::new(level, "fiber terminated with a defect", fiber.id().clone())
                    .with_cause(cause.pretty());
                self.logger.log(&entry);
            }
        }
    }

    fn root_refs(&self) -> FiberRefs {
        let mut refs = FiberRefs::default();
        refs.set(CURRENT_LOG_LEVEL.def(), Value::new(self.config.log.level));
        refs
    }

    /// Create and start a root fiber on `executor`.
    ///
    /// `observer` is attached before the fiber starts so it cannot miss
    /// the exit.
    fn spawn_root(
        self: &Arc<Self>,
        op: Op,
        executor: Arc<dyn Executor>,
        observer: Option<Observer>,
    ) -> Arc<FiberRuntime> {
        let op = if self.shutdown.load(Ordering::Acquire) {
            Op::die("runtime is shut down")
        } else {
            op
        };
        let fiber = FiberRuntime::new(self.clone(), executor, next_fiber_id(None), None, self.root_refs());
        self.add_root(fiber.clone());
        self.on_fiber_start(&fiber);
        if let Some(observer) = observer {
            fiber.add_observer(observer);
        }
        fiber.start(op);
        fiber
    }
}

/// An effect runtime: worker pool, timer, root registry and hooks.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.inner.scheduler.num_workers())
            .field("roots", &self.roots_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Runtime {
    /// Start a runtime with `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        RuntimeBuilder::new().config(config).build()
    }

    /// A builder for a customized runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Start `effect` on a new root fiber.
    pub fn run_fork<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        self.fork_observed(effect, None)
    }

    fn fork_observed<A: Data, E: Data>(&self, effect: Effect<A, E>, observer: Option<Observer>) -> Fiber<A, E> {
        let executor: Arc<dyn Executor> = self.inner.scheduler.clone();
        Fiber::new(self.inner.spawn_root(effect.op, executor, observer))
    }

    /// Start `effect` and call `on_exit` with its exit.
    ///
    /// The callback runs on whichever thread finishes the fiber.
    pub fn run_callback<A: Data, E: Data>(
        &self,
        effect: Effect<A, E>,
        on_exit: impl FnOnce(Exit<A, E>) + Send + 'static,
    ) -> Fiber<A, E> {
        self.fork_observed(
            effect,
            Some(Box::new(move |exit: &Exit<Value, Value>| on_exit(typed_exit(exit.clone())))),
        )
    }

    /// Start `effect` and return a promise of its result.
    pub fn run_promise<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Promise<A, E> {
        Promise {
            completion: Completion::attach(|observer| self.fork_observed(effect, Some(observer))),
        }
    }

    /// Start `effect` and return a promise of its full exit.
    pub fn run_promise_exit<A: Data, E: Data>(&self, effect: Effect<A, E>) -> PromiseExit<A, E> {
        PromiseExit {
            completion: Completion::attach(|observer| self.fork_observed(effect, Some(observer))),
        }
    }

    /// Run `effect` to completion on the calling thread.
    ///
    /// Forked fibers run on the calling thread too. If the effect suspends
    /// on something outside the run (a timer, another runtime's fiber) it is
    /// interrupted and the run dies.
    pub fn run_sync_exit<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let executor = Arc::new(SyncExecutor::new());
        // The caller receives the exit, so the fiber counts as observed.
        let fiber = self
            .inner
            .spawn_root(effect.op, executor.clone(), Some(Box::new(|_: &Exit<Value, Value>| {})));
        executor.flush();
        if let Some(exit) = fiber.poll_exit() {
            return typed_exit(exit);
        }
        tracing::debug!(fiber = %fiber.id(), "run_sync effect suspended asynchronously");
        fiber.interrupt_as(FiberId::None);
        executor.flush();
        Exit::die(format!(
            "effect suspended asynchronously in run_sync (fiber {})",
            fiber.id()
        ))
    }

    /// Run `effect` to completion on the calling thread.
    pub fn run_sync<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Result<A, FiberFailure<E>> {
        self.run_sync_exit(effect).into_result().map_err(FiberFailure::new)
    }

    /// Number of live root fibers.
    pub fn roots_count(&self) -> usize {
        self.inner.roots.lock().len()
    }

    /// Counters for fibers and the scheduler.
    pub fn stats(&self) -> RuntimeStats {
        self.inner.stats.snapshot(
            self.roots_count(),
            self.inner.timer.pending(),
            self.inner.scheduler.stats(),
            self.inner.started.elapsed(),
        )
    }

    /// Whether `shutdown` has started.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Interrupt every root fiber, wait for them up to the graceful
    /// timeout, then stop the timer and the workers.
    ///
    /// Effects started afterwards die immediately.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let roots: Vec<Arc<FiberRuntime>> = self.inner.roots.lock().values().cloned().collect();
        tracing::debug!(roots = roots.len(), "runtime shutting down");
        for root in &roots {
            root.interrupt_as(FiberId::None);
        }

        let deadline = Instant::now() + self.inner.config.shutdown.graceful_timeout;
        {
            let mut live = self.inner.roots.lock();
            while !live.is_empty() {
                if self.inner.roots_drained.wait_until(&mut live, deadline).timed_out() {
                    tracing::warn!(remaining = live.len(), "root fibers still running at shutdown");
                    live.clear();
                    break;
                }
            }
        }

        self.inner.timer.shutdown();
        self.inner.scheduler.shutdown();
        tracing::debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    logger: Option<Arc<dyn Logger>>,
    tracer: Option<Arc<dyn Tracer>>,
    supervisors: Vec<Arc<dyn Supervisor>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// A builder with default configuration and `tracing`-backed hooks.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            logger: None,
            tracer: None,
            supervisors: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the fairness threshold.
    pub fn max_ops_before_yield(mut self, n: usize) -> Self {
        self.config.scheduler.max_ops_before_yield = n;
        self
    }

    /// Set the minimum level for effect logs.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Install a logger.
    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Install a tracer.
    pub fn tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Add a supervisor; every supervisor sees every fiber.
    pub fn supervisor(mut self, supervisor: impl Supervisor + 'static) -> Self {
        self.supervisors.push(Arc::new(supervisor));
        self
    }

    /// Validate the configuration and start the threads.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        self.config.validate()?;
        let scheduler = Arc::new(Scheduler::start(&self.config.scheduler)?);
        let timer = Arc::new(Timer::start()?);
        tracing::debug!(
            workers = scheduler.num_workers(),
            max_ops_before_yield = self.config.scheduler.max_ops_before_yield,
            "runtime started"
        );
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                scheduler,
                timer,
                logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
                tracer: self.tracer.unwrap_or_else(|| Arc::new(TracingTracer)),
                supervisors: self.supervisors,
                roots: Mutex::new(HashMap::new()),
                roots_drained: Condvar::new(),
                stats: StatsCounters::default(),
                started: Instant::now(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// Promises
// ============================================================================

/// Exit delivery from a fiber observer to a blocking or async waiter.
struct Completion<A, E> {
    fiber: Fiber<A, E>,
    receiver: Receiver<Exit<A, E>>,
    waker: Arc<Mutex<Option<Waker>>>,
    exit: Option<Exit<A, E>>,
}

impl<A: Data, E: Data> Completion<A, E> {
    fn attach(spawn: impl FnOnce(Observer) -> Fiber<A, E>) -> Self {
        let (sender, receiver): (Sender<Exit<A, E>>, Receiver<Exit<A, E>>) = crossbeam_channel::bounded(1);
        let waker: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
        let wake = waker.clone();
        let fiber = spawn(Box::new(move |exit: &Exit<Value, Value>| {
            let _ = sender.send(typed_exit(exit.clone()));
            if let Some(waker) = wake.lock().take() {
                waker.wake();
            }
        }));
        Self {
            fiber,
            receiver,
            waker,
            exit: None,
        }
    }

    fn wait(&mut self) -> Exit<A, E> {
        if let Some(exit) = self.exit.take() {
            return exit;
        }
        match self.receiver.recv() {
            Ok(exit) => exit,
            Err(_) => lost_exit(),
        }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Option<Exit<A, E>> {
        if self.exit.is_none() {
            match self.receiver.recv_timeout(timeout) {
                Ok(exit) => self.exit = Some(exit),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => self.exit = Some(lost_exit()),
            }
        }
        self.exit.clone()
    }

    fn poll_exit(&mut self, cx: &mut Context<'_>) -> Poll<Exit<A, E>> {
        if let Some(exit) = self.exit.take() {
            return Poll::Ready(exit);
        }
        *self.waker.lock() = Some(cx.waker().clone());
        match self.receiver.try_recv() {
            Ok(exit) => Poll::Ready(exit),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Ready(lost_exit()),
        }
    }
}

// The observer is dropped unrun only if the fiber never completes and is
// discarded, which happens when the runtime shuts down under it.
fn lost_exit<A, E>() -> Exit<A, E> {
    Exit::Failure(Cause::die("runtime shut down before the fiber completed"))
}

/// A pending result of [`Runtime::run_promise`].
///
/// Wait on it from a thread with `wait`, or `.await` it from any executor.
pub struct Promise<A, E = Infallible> {
    completion: Completion<A, E>,
}

impl<A: Data, E: Data> Promise<A, E> {
    /// The fiber computing the result.
    pub fn fiber(&self) -> &Fiber<A, E> {
        &self.completion.fiber
    }

    /// Block until the fiber finishes.
    pub fn wait(mut self) -> Result<A, FiberFailure<E>> {
        self.completion.wait().into_result().map_err(FiberFailure::new)
    }

    /// Block until the fiber finishes, returning the full exit.
    pub fn wait_exit(mut self) -> Exit<A, E> {
        self.completion.wait()
    }

    /// Block up to `timeout`; `None` if the fiber is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<A, FiberFailure<E>>> {
        self.completion
            .wait_timeout(timeout)
            .map(|exit| exit.into_result().map_err(FiberFailure::new))
    }
}

impl<A: Data, E: Data> Future for Promise<A, E> {
    type Output = Result<A, FiberFailure<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.completion
            .poll_exit(cx)
            .map(|exit| exit.into_result().map_err(FiberFailure::new))
    }
}

/// A pending exit of [`Runtime::run_promise_exit`].
pub struct PromiseExit<A, E = Infallible> {
    completion: Completion<A, E>,
}

impl<A: Data, E: Data> PromiseExit<A, E> {
    /// The fiber computing the result.
    pub fn fiber(&self) -> &Fiber<A, E> {
        &self.completion.fiber
    }

    /// Block until the fiber finishes.
    pub fn wait(mut self) -> Exit<A, E> {
        self.completion.wait()
    }

    /// Block up to `timeout`; `None` if the fiber is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Exit<A, E>> {
        self.completion.wait_timeout(timeout)
    }
}

impl<A: Data, E: Data> Future for PromiseExit<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().completion.poll_exit(cx)
    }
}

impl<A, E> Unpin for Completion<A, E> {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLogger;
    use crate::observability::RecordingSupervisor;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Runtime::builder().num_workers(0).build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_run_sync_success_and_failure() {
        let rt = rt();
        assert_eq!(rt.run_sync(Effect::<i32>::succeed(7)).unwrap(), 7);
        let err = rt.run_sync(Effect::<i32, String>::fail("no".into())).unwrap_err();
        assert_eq!(err.failure(), Some(&"no".to_string()));
        assert_eq!(rt.roots_count(), 0);
    }

    #[test]
    fn test_run_sync_dies_on_async_suspension() {
        let rt = rt();
        let eff: Effect<()> = Effect::sleep(Duration::from_secs(5));
        let exit = rt.run_sync_exit(eff);
        assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
    }

    #[test]
    fn test_run_promise_with_sleep() {
        let rt = rt();
        let eff: Effect<i32> = Effect::sleep(Duration::from_millis(10)).map_to(3);
        assert_eq!(rt.run_promise(eff).wait().unwrap(), 3);
    }

    #[test]
    fn test_run_promise_exit_keeps_full_cause() {
        let rt = rt();
        let eff: Effect<i32, String> =
            Effect::fail("a".to_string()).ensuring(Effect::die("finalizer"));
        let exit = rt.run_promise_exit(eff).wait();
        let cause = exit.cause().cloned().unwrap_or_default();
        assert_eq!(cause.failures().len(), 1);
        assert_eq!(cause.defects().len(), 1);
    }

    #[test]
    fn test_run_callback() {
        let rt = rt();
        let (tx, rx) = crossbeam_channel::bounded(1);
        rt.run_callback(Effect::<i32>::succeed(5), move |exit| {
            tx.send(exit.value().copied()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(5));
    }

    #[test]
    fn test_wait_timeout_on_never() {
        let rt = rt();
        let mut promise = rt.run_promise(Effect::<i32>::never());
        assert!(promise.wait_timeout(Duration::from_millis(20)).is_none());
        promise.fiber().unsafe_interrupt();
        let result = promise.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.unwrap_err().is_interrupted());
    }

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_promise_future_is_woken() {
        let rt = rt();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);
        let mut promise = rt.run_promise(Effect::<()>::sleep(Duration::from_millis(20)).map_to(9));
        let first = Pin::new(&mut promise).poll(&mut cx);
        assert!(first.is_pending());
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.0.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        match Pin::new(&mut promise).poll(&mut cx) {
            Poll::Ready(result) => assert_eq!(result.unwrap(), 9),
            Poll::Pending => panic!("promise not ready after wake"),
        }
    }

    #[test]
    fn test_shutdown_interrupts_roots() {
        let rt = rt();
        let fiber = rt.run_fork(Effect::<i32>::never());
        assert_eq!(rt.roots_count(), 1);
        rt.shutdown();
        assert!(rt.is_shutdown());
        assert_eq!(rt.roots_count(), 0);
        assert!(fiber.unsafe_poll().map(|e| e.is_interrupted()).unwrap_or(false));
        let after = rt.run_sync_exit(Effect::<i32>::succeed(1));
        assert!(after.is_failure());
    }

    #[test]
    fn test_unobserved_defect_is_logged() {
        let logger = Arc::new(MemoryLogger::new());
        let rt = Runtime::builder().num_workers(1).logger(logger.clone()).build().unwrap();
        let _fiber = rt.run_fork(Effect::<i32>::die("kaboom"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while logger.entries().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert!(entries[0].cause.as_deref().unwrap_or("").contains("kaboom"));
    }

    #[test]
    fn test_stats_and_supervisor() {
        let supervisor = Arc::new(RecordingSupervisor::new());
        let rt = Runtime::builder().num_workers(1).supervisor(supervisor.clone()).build().unwrap();
        let eff: Effect<i32> = Effect::succeed(1).fork::<Infallible>().flat_map(|f| f.join());
        assert_eq!(rt.run_promise(eff).wait().unwrap(), 1);
        let stats = rt.stats();
        assert_eq!(stats.fibers_started, 2);
        assert_eq!(stats.fibers_succeeded, 2);
        assert_eq!(supervisor.ended().len(), 2);
    }

    #[test]
    fn test_stats_count_pending_timers() {
        let rt = Runtime::builder().num_workers(1).build().unwrap();
        let sleeper = rt.run_fork(Effect::<()>::sleep(Duration::from_secs(30)));
        let mut pending = 0;
        for _ in 0..500 {
            pending = rt.stats().pending_timers;
            if pending == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pending, 1);

        rt.run_promise(sleeper.interrupt::<Infallible>()).wait().unwrap();
        assert_eq!(rt.stats().pending_timers, 0);
    }
}
