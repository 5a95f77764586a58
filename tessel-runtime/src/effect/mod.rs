//! # Effects
//!
//! An [`Effect<A, E>`] is an inert, immutable description of a computation
//! that may succeed with an `A`, fail with an `E`, die with a defect, or be
//! interrupted. Building one runs nothing; a [`Runtime`](crate::Runtime)
//! interprets it on a fiber.
//!
//! ## Design
//!
//! - Effects are a thin typed shell around a small, closed AST ([`Op`])
//! - Continuations are boxed closures over erased values; the interpreter
//!   keeps them on an explicit heap stack so deep `flat_map` chains never
//!   grow the native stack
//! - Every closure is `Fn + Send + Sync`, so one description can be run any
//!   number of times, from any thread
//!
//! Operators are grouped by concern: constructors live here, sequencing and
//! error handling in [`combinators`], forking and racing in [`concurrency`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::{Effect, Runtime};
//!
//! let program: Effect<i32, String> = Effect::succeed(20)
//!     .flat_map(|n| Effect::sync(move || n + 1))
//!     .map(|n| n * 2);
//!
//! let runtime = Runtime::new(Default::default())?;
//! assert_eq!(runtime.run_sync(program)?, 42);
//! ```

mod combinators;
mod concurrency;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::fiber_runtime::{FiberContext, Resume};
use crate::value::{Data, Value};

pub(crate) type SuccessK = Arc<dyn Fn(Value) -> Op + Send + Sync>;
pub(crate) type FailureK = Arc<dyn Fn(Cause<Value>) -> Op + Send + Sync>;
pub(crate) type RegisterFn = Arc<dyn Fn(Resume) -> Option<Op> + Send + Sync>;
pub(crate) type RuntimeFn = Arc<dyn Fn(&mut FiberContext<'_>) -> Op + Send + Sync>;

/// The effect AST.
///
/// Values and errors are erased; the typed layer guarantees the downcasts.
#[derive(Clone)]
pub(crate) enum Op {
    /// Terminal success.
    Succeed(Value),
    /// Terminal failure.
    Failure(Cause<Value>),
    /// Run a synchronous side effect producing a value.
    Sync(Arc<dyn Fn() -> Value + Send + Sync>),
    /// Compute the next effect lazily.
    Suspend(Arc<dyn Fn() -> Op + Send + Sync>),
    /// Register a callback and park until it is invoked exactly once.
    ///
    /// `register` may return a canceler run if the fiber is interrupted
    /// while parked.
    Async {
        register: RegisterFn,
        blocking_on: FiberId,
    },
    /// Run `first`, then continue with `k` on success.
    OnSuccess { first: Child, k: SuccessK },
    /// Run `first`, then continue with `k` on failure.
    OnFailure { first: Child, k: FailureK },
    /// Run `first`, then continue on either outcome.
    OnSuccessAndFailure {
        first: Child,
        on_failure: FailureK,
        on_success: SuccessK,
    },
    /// Access the running fiber.
    WithRuntime(RuntimeFn),
    /// Run `body` with interruption enabled or disabled.
    SetInterruptible { interruptible: bool, body: Child },
    /// Give the worker back to the scheduler.
    Yield,
}

impl Op {
    pub(crate) fn unit() -> Op {
        Op::Succeed(Value::unit())
    }

    pub(crate) fn die(defect: impl Into<Defect>) -> Op {
        Op::Failure(Cause::Die(defect.into()))
    }

    pub(crate) fn sync_unit(f: impl Fn() + Send + Sync + 'static) -> Op {
        Op::Sync(Arc::new(move || {
            f();
            Value::unit()
        }))
    }

    pub(crate) fn suspend(f: impl Fn() -> Op + Send + Sync + 'static) -> Op {
        Op::Suspend(Arc::new(f))
    }

    pub(crate) fn with_runtime(f: impl Fn(&mut FiberContext<'_>) -> Op + Send + Sync + 'static) -> Op {
        Op::WithRuntime(Arc::new(f))
    }

    pub(crate) fn on_success(self, k: impl Fn(Value) -> Op + Send + Sync + 'static) -> Op {
        Op::OnSuccess {
            first: Child::new(self),
            k: Arc::new(k),
        }
    }

    pub(crate) fn on_failure(self, k: impl Fn(Cause<Value>) -> Op + Send + Sync + 'static) -> Op {
        Op::OnFailure {
            first: Child::new(self),
            k: Arc::new(k),
        }
    }

    pub(crate) fn on_both(
        self,
        on_failure: impl Fn(Cause<Value>) -> Op + Send + Sync + 'static,
        on_success: impl Fn(Value) -> Op + Send + Sync + 'static,
    ) -> Op {
        Op::OnSuccessAndFailure {
            first: Child::new(self),
            on_failure: Arc::new(on_failure),
            on_success: Arc::new(on_success),
        }
    }

    pub(crate) fn uninterruptible(self) -> Op {
        Op::SetInterruptible {
            interruptible: false,
            body: Child::new(self),
        }
    }

    pub(crate) fn from_exit(exit: Exit<Value, Value>) -> Op {
        match exit {
            Exit::Success(v) => Op::Succeed(v),
            Exit::Failure(cause) => Op::Failure(cause),
        }
    }

    /// Run `self`, then `next` regardless of the outcome, keeping `self`'s result.
    ///
    /// A failure of `next` is appended to the prevailing cause.
    pub(crate) fn ensuring(self, next: Op) -> Op {
        let on_fail_next = next.clone();
        self.on_both(
            move |cause| {
                let cause_ok = cause.clone();
                on_fail_next.clone().on_both(
                    move |fin| Op::Failure(cause.clone().then(fin)),
                    move |_| Op::Failure(cause_ok.clone()),
                )
            },
            move |value| next.clone().on_success(move |_| Op::Succeed(value.clone())),
        )
    }

    fn child_mut(&mut self) -> Option<&mut Child> {
        match self {
            Op::OnSuccess { first, .. }
            | Op::OnFailure { first, .. }
            | Op::OnSuccessAndFailure { first, .. } => Some(first),
            Op::SetInterruptible { body, .. } => Some(body),
            _ => None,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Op::Succeed(_) => "Succeed",
            Op::Failure(_) => "Failure",
            Op::Sync(_) => "Sync",
            Op::Suspend(_) => "Suspend",
            Op::Async { .. } => "Async",
            Op::OnSuccess { .. } => "OnSuccess",
            Op::OnFailure { .. } => "OnFailure",
            Op::OnSuccessAndFailure { .. } => "OnSuccessAndFailure",
            Op::WithRuntime(_) => "WithRuntime",
            Op::SetInterruptible { .. } => "SetInterruptible",
            Op::Yield => "Yield",
        }
    }
}

/// A shared child node of the AST.
///
/// Cloning is shallow and dropping the last handle to a long chain unlinks
/// it node by node, so neither grows the native stack with the chain.
pub(crate) struct Child(Option<Arc<Op>>);

impl Child {
    fn new(op: Op) -> Self {
        Child(Some(Arc::new(op)))
    }

    /// Take the node, cloning its top level if it is still shared.
    pub(crate) fn into_op(mut self) -> Op {
        match self.0.take() {
            Some(op) => Arc::unwrap_or_clone(op),
            None => Op::die("effect node already consumed"),
        }
    }
}

impl Clone for Child {
    fn clone(&self) -> Self {
        Child(self.0.clone())
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        let mut pending: Vec<Arc<Op>> = self.0.take().into_iter().collect();
        while let Some(node) = pending.pop() {
            if let Some(mut op) = Arc::into_inner(node) {
                if let Some(child) = op.child_mut() {
                    pending.extend(child.0.take());
                }
            }
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A description of a computation producing `A` or failing with `E`.
pub struct Effect<A, E = Infallible> {
    pub(crate) op: Op,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self::from_op(self.op.clone())
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({:?})", self.op)
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_op(op: Op) -> Self {
        Self {
            op,
            _marker: PhantomData,
        }
    }
}

/// Restores the interruptibility that was in force outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn apply<A, E>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_op(Op::SetInterruptible {
            interruptible: self.interruptible,
            body: Child::new(effect.op),
        })
    }
}

/// Typed resumption handle passed to [`Effect::async_`] register functions.
///
/// Only the first call has any effect.
pub struct Callback<A, E> {
    resume: Resume,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Data, E: Data> Callback<A, E> {
    /// Resume the fiber with an effect to continue from.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.resume.resume(effect.op);
    }

    /// Resume with a success.
    pub fn succeed(&self, value: A) {
        self.resume.resume(Op::Succeed(Value::new(value)));
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume.resume(Op::Failure(Cause::Fail(Value::new(error))));
    }

    /// Resume with an exit.
    pub fn done(&self, exit: Exit<A, E>) {
        self.resume(Effect::from_exit(exit));
    }
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Data, E: Data> Effect<A, E> {
    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_op(Op::Succeed(Value::new(value)))
    }

    /// Fail with a typed error.
    pub fn fail(error: E) -> Self {
        Self::from_op(Op::Failure(Cause::Fail(Value::new(error))))
    }

    /// Fail with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_op(Op::Failure(cause.map(Value::new)))
    }

    /// Die with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::from_op(Op::die(defect))
    }

    /// Die with a message.
    pub fn die_message(message: impl fmt::Display) -> Self {
        Self::from_op(Op::die(Defect::new(message)))
    }

    /// Fail with an interruption by the current fiber.
    pub fn interrupt() -> Self {
        Self::from_op(Op::with_runtime(|ctx| {
            Op::Failure(Cause::Interrupt(ctx.id()))
        }))
    }

    /// Adopt an exit.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Adopt a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Run a synchronous side effect. A panic becomes a defect.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_op(Op::Sync(Arc::new(move || Value::new(f()))))
    }

    /// Run a fallible synchronous side effect.
    pub fn try_sync(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_op(Op::suspend(move || match f() {
            Ok(a) => Op::Succeed(Value::new(a)),
            Err(e) => Op::Failure(Cause::Fail(Value::new(e))),
        }))
    }

    /// Build the effect lazily, each time it runs.
    pub fn suspend(f: impl Fn() -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_op(Op::suspend(move || f().op))
    }

    /// Suspend until `register`'s callback is invoked.
    ///
    /// The callback may be invoked immediately or later, from any thread;
    /// only the first invocation counts.
    pub fn async_(register: impl Fn(Callback<A, E>) + Send + Sync + 'static) -> Self {
        Self::async_interrupt(move |cb| {
            register(cb);
            None
        })
    }

    /// Like [`Effect::async_`], with an optional canceler run if the fiber
    /// is interrupted while waiting.
    pub fn async_interrupt(
        register: impl Fn(Callback<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    ) -> Self {
        Self::from_op(Op::Async {
            register: Arc::new(move |resume: Resume| {
                let cb = Callback {
                    resume,
                    _marker: PhantomData,
                };
                register(cb).map(|canceler| canceler.op)
            }),
            blocking_on: FiberId::None,
        })
    }

    /// Never completes; only interruption ends it.
    pub fn never() -> Self {
        Self::from_op(Op::Async {
            register: Arc::new(|_resume: Resume| None),
            blocking_on: FiberId::None,
        })
    }

    /// Give the fiber access to its own runtime state.
    pub fn with_runtime(
        f: impl Fn(&mut FiberContext<'_>) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        Self::from_op(Op::with_runtime(move |ctx| f(ctx).op))
    }

    /// Run with interruption disabled, handing `f` a way to restore the
    /// surrounding interruptibility for sub-regions.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_op(Op::with_runtime(move |ctx| {
            let restore = Restore {
                interruptible: ctx.is_interruptible(),
            };
            f(restore).op.uninterruptible()
        }))
    }

    /// Run with interruption enabled.
    pub fn interruptible(self) -> Self {
        Self::from_op(Op::SetInterruptible {
            interruptible: true,
            body: Child::new(self.op),
        })
    }

    /// Run with interruption disabled.
    pub fn uninterruptible(self) -> Self {
        Self::from_op(self.op.uninterruptible())
    }
}

impl<E: Data> Effect<(), E> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::from_op(Op::unit())
    }

    /// Yield the worker to other fibers, then continue.
    pub fn yield_now() -> Self {
        Self::from_op(Op::Yield)
    }

    /// Suspend for `duration` without blocking a worker thread.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_op(Op::with_runtime(move |ctx| {
            let timer = ctx.timer();
            Op::Async {
                register: Arc::new(move |resume: Resume| {
                    let key = timer.schedule(duration, move || resume.resume(Op::unit()));
                    let timer = timer.clone();
                    Some(Op::sync_unit(move || {
                        timer.cancel(key);
                    }))
                }),
                blocking_on: FiberId::None,
            }
        }))
    }
}

impl<E: Data> Effect<FiberId, E> {
    /// The id of the fiber running this effect.
    pub fn fiber_id() -> Self {
        Self::from_op(Op::with_runtime(|ctx| Op::Succeed(Value::new(ctx.id()))))
    }
}

impl<A: Data> Effect<A, Infallible> {
    /// Re-type an effect that cannot fail so it composes with fallible ones.
    pub fn widen_error<E: Data>(self) -> Effect<A, E> {
        Effect::from_op(self.op)
    }
}

// ============================================================================
// Tests
// ============================================================================
