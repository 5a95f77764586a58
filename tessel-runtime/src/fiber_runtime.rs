//! # Fiber Interpreter
//!
//! The state machine behind every fiber.
//!
//! ## Design
//!
//! - A fiber is driven by messages: `Resume(op)` starts or continues
//!   evaluation, `InterruptSignal` delivers a pending interruption
//! - At most one worker drains a fiber's mailbox at a time; the `running`
//!   flag hands ownership between threads
//! - Evaluation is a trampoline: continuations go on a heap stack of frames,
//!   so effect depth never consumes native stack
//! - After `max_ops_before_yield` steps the fiber re-enqueues itself so one
//!   busy fiber cannot starve the others on its worker
//!
//! ## Interruption
//!
//! Interruption is a request. It is absorbed into the fiber's `interrupted`
//! cause and acted on only while the fiber is interruptible: the current
//! instruction is replaced by a failure, error handlers are skipped, and a
//! parked async operation is cancelled through its canceler. Finalizers run
//! in uninterruptible regions and therefore always complete.
//!
//! ## Structured concurrency
//!
//! Non-daemon children are registered with their parent. When the parent's
//! body finishes, it interrupts every child that is still alive and waits
//! for all of them before reporting its own exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{FailureK, Op, SuccessK};
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, FiberId, FiberStatus};
use crate::fiber_ref::{FiberRef, FiberRefs, FiberRefsPatch};
use crate::log::Logger;
use crate::observability::Tracer;
use crate::runtime::RuntimeInner;
use crate::scheduler::Executor;
use crate::timer::Timer;
use crate::value::{Data, Value};

/// Callback invoked once with a fiber's exit.
pub(crate) type Observer = Box<dyn FnOnce(&Exit<Value, Value>) + Send>;

enum FiberMessage {
    Resume(Op),
    InterruptSignal,
}

enum Frame {
    OnSuccess(SuccessK),
    OnFailure(FailureK),
    OnSuccessAndFailure(FailureK, SuccessK),
    RevertInterruptible(bool),
}

enum Step {
    /// Parked or finished; keep draining the mailbox.
    Continue,
    /// Hand the worker back and reschedule.
    Yield,
}

/// One-shot resumption handle for a parked fiber.
///
/// Only the first of the callback and the canceler wins the claim.
#[derive(Clone)]
pub(crate) struct Resume {
    fiber: Arc<FiberRuntime>,
    claimed: Arc<AtomicBool>,
}

impl Resume {
    pub(crate) fn resume(&self, op: Op) {
        self.try_resume(op);
    }

    /// Resume the fiber, reporting whether this call won the claim.
    ///
    /// A `false` means the fiber was already resumed or cancelled and `op`
    /// was dropped.
    pub(crate) fn try_resume(&self, op: Op) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.fiber.tell(FiberMessage::Resume(op));
        true
    }

    pub(crate) fn fiber_id(&self) -> &FiberId {
        &self.fiber.id
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resume({})", self.fiber.id)
    }
}

struct PendingAsync {
    claimed: Arc<AtomicBool>,
    canceler: Option<Op>,
}

/// State touched only by the worker currently draining the fiber.
pub(crate) struct FiberCore {
    stack: Vec<Frame>,
    refs: FiberRefs,
    initial_refs: FiberRefs,
    interruptible: bool,
    interrupted: Cause<Value>,
    pending: Option<PendingAsync>,
}

/// State visible to other fibers.
struct Shared {
    status: FiberStatus,
    exit: Option<Exit<Value, Value>>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
    children: HashMap<u64, Arc<FiberRuntime>>,
    pending_interrupts: Vec<FiberId>,
    interruptors: HashSet<FiberId>,
    parent: Option<Weak<FiberRuntime>>,
    patch: Option<FiberRefsPatch>,
}

/// The runtime side of a fiber.
pub(crate) struct FiberRuntime {
    id: FiberId,
    key: u64,
    parent_id: FiberId,
    runtime: Arc<RuntimeInner>,
    executor: Arc<dyn Executor>,
    mailbox: Mutex<VecDeque<FiberMessage>>,
    running: AtomicBool,
    interrupt_signal: AtomicBool,
    done: AtomicBool,
    core: Mutex<FiberCore>,
    shared: Mutex<Shared>,
}

impl fmt::Debug for FiberRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRuntime")
            .field("id", &self.id)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

impl FiberRuntime {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        executor: Arc<dyn Executor>,
        id: FiberId,
        parent: Option<&Arc<FiberRuntime>>,
        refs: FiberRefs,
    ) -> Arc<Self> {
        let key = id.seq().unwrap_or_default();
        Arc::new(Self {
            key,
            parent_id: parent.map(|p| p.id.clone()).unwrap_or(FiberId::None),
            runtime,
            executor,
            mailbox: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            interrupt_signal: AtomicBool::new(false),
            done: AtomicBool::new(false),
            core: Mutex::new(FiberCore {
                stack: Vec::new(),
                initial_refs: refs.clone(),
                refs,
                interruptible: true,
                interrupted: Cause::Empty,
                pending: None,
            }),
            shared: Mutex::new(Shared {
                status: FiberStatus::Running {
                    interrupting: false,
                },
                exit: None,
                observers: Vec::new(),
                next_observer: 0,
                children: HashMap::new(),
                pending_interrupts: Vec::new(),
                interruptors: HashSet::new(),
                parent: parent.map(Arc::downgrade),
                patch: None,
            }),
            id,
        })
    }

    pub(crate) fn id(&self) -> &FiberId {
        &self.id
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn parent_id(&self) -> &FiberId {
        &self.parent_id
    }

    /// Begin evaluating `op`.
    pub(crate) fn start(self: &Arc<Self>, op: Op) {
        self.tell(FiberMessage::Resume(op));
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status.clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn poll_exit(&self) -> Option<Exit<Value, Value>> {
        self.shared.lock().exit.clone()
    }

    pub(crate) fn interruptors(&self) -> HashSet<FiberId> {
        self.shared.lock().interruptors.clone()
    }

    pub(crate) fn refs_patch(&self) -> Option<FiberRefsPatch> {
        self.shared.lock().patch.clone()
    }

    pub(crate) fn child_count(&self) -> usize {
        self.shared.lock().children.len()
    }

    pub(crate) fn children(&self) -> Vec<Arc<FiberRuntime>> {
        self.shared.lock().children.values().cloned().collect()
    }

    fn add_child(&self, child: Arc<FiberRuntime>) {
        self.shared.lock().children.insert(child.key, child);
    }

    fn remove_child(&self, key: u64) {
        self.shared.lock().children.remove(&key);
    }

    /// Register a callback for the fiber's exit.
    ///
    /// If the fiber is already done the callback runs immediately and no key
    /// is returned.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let mut shared = self.shared.lock();
        match shared.exit.clone() {
            Some(exit) => {
                drop(shared);
                observer(&exit);
                None
            }
            None => {
                let key = shared.next_observer;
                shared.next_observer += 1;
                shared.observers.push((key, observer));
                Some(key)
            }
        }
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.shared.lock().observers.retain(|(k, _)| *k != key);
    }

    /// Request interruption on behalf of `by`.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        {
            let mut shared = self.shared.lock();
            if shared.exit.is_some() {
                return;
            }
            shared.pending_interrupts.push(by.clone());
            shared.interruptors.insert(by);
            if let FiberStatus::Running { .. } = shared.status {
                shared.status = FiberStatus::Running { interrupting: true };
            }
        }
        self.interrupt_signal.store(true, Ordering::Release);
        self.tell(FiberMessage::InterruptSignal);
    }

    fn tell(self: &Arc<Self>, message: FiberMessage) {
        self.mailbox.lock().push_back(message);
        if !self.running.swap(true, Ordering::AcqRel) {
            self.schedule_drain();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        let fiber = self.clone();
        self.executor.submit(Box::new(move || fiber.drain()));
    }

    fn set_status(&self, status: FiberStatus) {
        let mut shared = self.shared.lock();
        if shared.exit.is_none() {
            shared.status = status;
        }
    }

    fn drain(self: Arc<Self>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drain_inner()));
        if let Err(payload) = outcome {
            let defect = Defect::from_panic(payload);
            tracing::error!(fiber = %self.id, %defect, "fiber interpreter panicked");
            let mut core = self.core.lock();
            self.complete(&mut core, Exit::Failure(Cause::Die(defect)));
            drop(core);
            self.mailbox.lock().clear();
            self.running.store(false, Ordering::Release);
        }
    }

    fn drain_inner(self: &Arc<Self>) {
        let mut core = self.core.lock();
        loop {
            let message = self.mailbox.lock().pop_front();
            match message {
                Some(message) => {
                    if self.is_done() {
                        continue;
                    }
                    if let Step::Yield = self.process(&mut core, message) {
                        drop(core);
                        self.schedule_drain();
                        return;
                    }
                }
                None => {
                    self.running.store(false, Ordering::Release);
                    if self.mailbox.lock().is_empty() {
                        return;
                    }
                    if self.running.swap(true, Ordering::AcqRel) {
                        return;
                    }
                }
            }
        }
    }

    fn process(self: &Arc<Self>, core: &mut FiberCore, message: FiberMessage) -> Step {
        match message {
            FiberMessage::Resume(mut op) => {
                core.pending = None;
                self.absorb_interrupts(core);
                if core.interruptible && !core.interrupted.is_empty() && !matches!(op, Op::Failure(_)) {
                    op = Op::Failure(core.interrupted.clone());
                }
                self.set_status(FiberStatus::Running {
                    interrupting: !core.interrupted.is_empty(),
                });
                self.run_loop(core, op)
            }
            FiberMessage::InterruptSignal => {
                self.absorb_interrupts(core);
                if !core.interruptible || core.interrupted.is_empty() {
                    return Step::Continue;
                }
                let pending = match core.pending.take() {
                    Some(pending) => pending,
                    None => return Step::Continue,
                };
                if pending.claimed.swap(true, Ordering::AcqRel) {
                    // The callback won; its Resume is already queued.
                    return Step::Continue;
                }
                let cause = core.interrupted.clone();
                let op = match pending.canceler {
                    Some(canceler) => {
                        let on_fail = cause.clone();
                        canceler.on_both(
                            move |fin| Op::Failure(on_fail.clone().then(fin)),
                            move |_| Op::Failure(cause.clone()),
                        )
                    }
                    None => Op::Failure(cause),
                };
                // Cancelers run uninterruptibly.
                core.stack.push(Frame::RevertInterruptible(true));
                core.interruptible = false;
                self.set_status(FiberStatus::Running { interrupting: true });
                self.run_loop(core, op)
            }
        }
    }

    /// Fold newly delivered interruptions into `core.interrupted`.
    ///
    /// Returns the newly absorbed part, if any.
    fn absorb_interrupts(&self, core: &mut FiberCore) -> Option<Cause<Value>> {
        if !self.interrupt_signal.swap(false, Ordering::AcqRel) {
            return None;
        }
        let ids = mem::take(&mut self.shared.lock().pending_interrupts);
        let known = core.interrupted.interruptors();
        let mut fresh = Cause::Empty;
        for id in ids {
            if !known.contains(&id) && !fresh.interruptors().contains(&id) {
                fresh = fresh.both(Cause::Interrupt(id));
            }
        }
        if fresh.is_empty() {
            return None;
        }
        core.interrupted = mem::take(&mut core.interrupted).both(fresh.clone());
        Some(fresh)
    }

    fn run_loop(self: &Arc<Self>, core: &mut FiberCore, mut cur: Op) -> Step {
        let max_ops = self.runtime.config.scheduler.max_ops_before_yield;
        let mut ops = 0usize;

        loop {
            if self.interrupt_signal.load(Ordering::Acquire) {
                if let Some(fresh) = self.absorb_interrupts(core) {
                    if core.interruptible {
                        cur = match cur {
                            Op::Failure(cause) => Op::Failure(cause.both(fresh)),
                            _ => Op::Failure(core.interrupted.clone()),
                        };
                    }
                }
            }

            if ops >= max_ops {
                self.mailbox.lock().push_front(FiberMessage::Resume(cur));
                return Step::Yield;
            }
            ops += 1;

            cur = match cur {
                Op::Succeed(value) => match unwind_success(core, value) {
                    Ok(next) => next,
                    Err(value) => match self.finish(core, Exit::Success(value)) {
                        Some(next) => next,
                        None => return Step::Continue,
                    },
                },
                Op::Failure(cause) => match unwind_failure(core, cause) {
                    Ok(next) => next,
                    Err(cause) => match self.finish(core, Exit::Failure(cause)) {
                        Some(next) => next,
                        None => return Step::Continue,
                    },
                },
                Op::Sync(f) => match panic::catch_unwind(AssertUnwindSafe(|| f())) {
                    Ok(value) => Op::Succeed(value),
                    Err(payload) => Op::Failure(Cause::Die(Defect::from_panic(payload))),
                },
                Op::Suspend(f) => guard(|| f()),
                Op::Async {
                    register,
                    blocking_on,
                } => {
                    if core.interruptible && !core.interrupted.is_empty() {
                        Op::Failure(core.interrupted.clone())
                    } else {
                        let claimed = Arc::new(AtomicBool::new(false));
                        let resume = Resume {
                            fiber: self.clone(),
                            claimed: claimed.clone(),
                        };
                        match panic::catch_unwind(AssertUnwindSafe(|| register(resume))) {
                            Ok(canceler) => {
                                core.pending = Some(PendingAsync { claimed, canceler });
                                self.set_status(FiberStatus::Suspended {
                                    interruptible: core.interruptible,
                                    blocking_on,
                                });
                                return Step::Continue;
                            }
                            Err(payload) => {
                                if claimed.swap(true, Ordering::AcqRel) {
                                    // Resumed before the panic; follow the resume.
                                    return Step::Continue;
                                }
                                Op::Failure(Cause::Die(Defect::from_panic(payload)))
                            }
                        }
                    }
                }
                Op::OnSuccess { first, k } => {
                    core.stack.push(Frame::OnSuccess(k));
                    first.into_op()
                }
                Op::OnFailure { first, k } => {
                    core.stack.push(Frame::OnFailure(k));
                    first.into_op()
                }
                Op::OnSuccessAndFailure {
                    first,
                    on_failure,
                    on_success,
                } => {
                    core.stack
                        .push(Frame::OnSuccessAndFailure(on_failure, on_success));
                    first.into_op()
                }
                Op::WithRuntime(f) => {
                    let mut ctx = FiberContext { fiber: self, core: &mut *core };
                    guard(|| f(&mut ctx))
                }
                Op::SetInterruptible {
                    interruptible,
                    body,
                } => {
                    if interruptible != core.interruptible {
                        core.stack
                            .push(Frame::RevertInterruptible(core.interruptible));
                        core.interruptible = interruptible;
                    }
                    if interruptible && !core.interrupted.is_empty() {
                        Op::Failure(core.interrupted.clone())
                    } else {
                        body.into_op()
                    }
                }
                Op::Yield => {
                    self.mailbox
                        .lock()
                        .push_back(FiberMessage::Resume(Op::unit()));
                    return Step::Yield;
                }
            };
        }
    }

    /// The body finished with `exit`. Reap children first, then complete.
    fn finish(self: &Arc<Self>, core: &mut FiberCore, exit: Exit<Value, Value>) -> Option<Op> {
        let children: Vec<Arc<FiberRuntime>> = {
            let mut shared = self.shared.lock();
            shared.children.drain().map(|(_, c)| c).collect()
        };
        let alive: Vec<Arc<FiberRuntime>> = children.into_iter().filter(|c| !c.is_done()).collect();
        if alive.is_empty() {
            self.complete(core, exit);
            return None;
        }
        tracing::trace!(fiber = %self.id, children = alive.len(), "interrupting children");
        core.interruptible = false;
        let exit_op = Op::from_exit(exit);
        Some(interrupt_and_await(alive, self.id.clone()).on_success(move |_| exit_op.clone()))
    }

    fn complete(self: &Arc<Self>, core: &mut FiberCore, exit: Exit<Value, Value>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        core.stack.clear();
        core.pending = None;
        let patch = FiberRefsPatch::diff(&core.initial_refs, &core.refs);
        let (observers, parent) = {
            let mut shared = self.shared.lock();
            shared.status = FiberStatus::Done;
            shared.exit = Some(exit.clone());
            shared.patch = (!patch.is_empty()).then_some(patch);
            shared.children.clear();
            (mem::take(&mut shared.observers), shared.parent.take())
        };

        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent.remove_child(self.key);
        }
        self.runtime.remove_root(self.key);

        self.runtime.on_fiber_end(self, &exit, !observers.is_empty());

        for (_, observer) in observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(&exit))) {
                let defect = Defect::from_panic(payload);
                tracing::error!(fiber = %self.id, %defect, "fiber observer panicked");
            }
        }
    }
}

fn guard(f: impl FnOnce() -> Op) -> Op {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(op) => op,
        Err(payload) => Op::Failure(Cause::Die(Defect::from_panic(payload))),
    }
}

fn unwind_success(core: &mut FiberCore, value: Value) -> Result<Op, Value> {
    while let Some(frame) = core.stack.pop() {
        match frame {
            Frame::OnSuccess(k) | Frame::OnSuccessAndFailure(_, k) => {
                return Ok(guard(move || k(value)));
            }
            Frame::OnFailure(_) => {}
            Frame::RevertInterruptible(flag) => {
                core.interruptible = flag;
                if flag && !core.interrupted.is_empty() {
                    return Ok(Op::Failure(core.interrupted.clone()));
                }
            }
        }
    }
    Err(value)
}

fn unwind_failure(core: &mut FiberCore, cause: Cause<Value>) -> Result<Op, Cause<Value>> {
    while let Some(frame) = core.stack.pop() {
        match frame {
            Frame::OnSuccess(_) => {}
            Frame::OnFailure(k) | Frame::OnSuccessAndFailure(k, _) => {
                // Interrupted and interruptible: handlers do not run.
                if core.interruptible && !core.interrupted.is_empty() {
                    continue;
                }
                return Ok(guard(move || k(cause)));
            }
            Frame::RevertInterruptible(flag) => core.interruptible = flag,
        }
    }
    Err(cause)
}

/// Interrupt every fiber in `fibers` on behalf of `by` and resume once all
/// of them are done.
pub(crate) fn interrupt_and_await(fibers: Vec<Arc<FiberRuntime>>, by: FiberId) -> Op {
    if fibers.is_empty() {
        return Op::unit();
    }
    let blocking_on = fibers
        .iter()
        .fold(FiberId::None, |acc, f| acc.combine(f.id.clone()));
    Op::Async {
        register: Arc::new(move |resume: Resume| {
            let remaining = Arc::new(AtomicUsize::new(fibers.len()));
            for fiber in &fibers {
                fiber.interrupt_as(by.clone());
            }
            for fiber in &fibers {
                let remaining = remaining.clone();
                let resume = resume.clone();
                fiber.add_observer(Box::new(move |_exit: &Exit<Value, Value>| {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        resume.resume(Op::unit());
                    }
                }));
            }
            None
        }),
        blocking_on,
    }
}

/// Access to the running fiber from inside an effect.
///
/// Obtained through [`Effect::with_runtime`](crate::Effect::with_runtime).
pub struct FiberContext<'a> {
    fiber: &'a Arc<FiberRuntime>,
    core: &'a mut FiberCore,
}

impl FiberContext<'_> {
    /// The running fiber's id.
    pub fn id(&self) -> FiberId {
        self.fiber.id.clone()
    }

    /// The id of the fiber that forked this one, or `FiberId::None` for roots.
    pub fn parent_id(&self) -> FiberId {
        self.fiber.parent_id.clone()
    }

    /// The running fiber's status.
    pub fn status(&self) -> FiberStatus {
        self.fiber.status()
    }

    /// Whether interruption would currently be honored.
    pub fn is_interruptible(&self) -> bool {
        self.core.interruptible
    }

    /// Whether an interruption has been delivered to this fiber.
    pub fn is_interrupted(&self) -> bool {
        !self.core.interrupted.is_empty() || self.fiber.interrupt_signal.load(Ordering::Acquire)
    }

    /// The fiber's value for `fiber_ref`.
    pub fn get_ref<A: Data>(&self, fiber_ref: &FiberRef<A>) -> A {
        self.core.refs.get(fiber_ref.def()).downcast::<A>()
    }

    /// Set the fiber's value for `fiber_ref`.
    pub fn set_ref<A: Data>(&mut self, fiber_ref: &FiberRef<A>, value: A) {
        self.core.refs.set(fiber_ref.def(), Value::new(value));
    }

    /// Number of live non-daemon children.
    pub fn child_count(&self) -> usize {
        self.fiber.child_count()
    }

    /// Ids of the live non-daemon children.
    pub fn children(&self) -> Vec<FiberId> {
        self.fiber.children().iter().map(|c| c.id.clone()).collect()
    }

    pub(crate) fn refs(&self) -> &FiberRefs {
        &self.core.refs
    }

    pub(crate) fn refs_mut(&mut self) -> &mut FiberRefs {
        &mut self.core.refs
    }

    pub(crate) fn apply_patch(&mut self, patch: &FiberRefsPatch) {
        patch.apply(&mut self.core.refs);
    }

    pub(crate) fn timer(&self) -> Arc<Timer> {
        self.fiber.runtime.timer.clone()
    }

    pub(crate) fn logger(&self) -> Arc<dyn Logger> {
        self.fiber.runtime.logger.clone()
    }

    pub(crate) fn tracer(&self) -> Arc<dyn Tracer> {
        self.fiber.runtime.tracer.clone()
    }

    /// Start `op` on a new fiber that inherits this fiber's refs.
    ///
    /// Daemons are owned by the runtime instead of by this fiber.
    pub(crate) fn fork(
        &mut self,
        op: Op,
        daemon: bool,
        location: Option<&'static Location<'static>>,
    ) -> Arc<FiberRuntime> {
        let refs = self.core.refs.fork_all();
        let id = next_fiber_id(location);
        let child = FiberRuntime::new(
            self.fiber.runtime.clone(),
            self.fiber.executor.clone(),
            id,
            Some(self.fiber),
            refs,
        );
        if daemon {
            child.shared.lock().parent = None;
            self.fiber.runtime.add_root(child.clone());
        } else {
            self.fiber.add_child(child.clone());
        }
        self.fiber.runtime.on_fiber_start(&child);
        child.start(op);
        child
    }
}
