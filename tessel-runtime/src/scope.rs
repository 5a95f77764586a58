//! # Scopes and Finalizers
//!
//! A [`Scope`] collects finalizers and runs them when it closes.
//!
//! ## Guarantees
//!
//! - Finalizers run in reverse order of registration
//! - Every finalizer runs, even if an earlier one fails; failures are
//!   combined sequentially into the close cause
//! - Closing is idempotent; a finalizer added after close runs immediately
//! - Finalizers run uninterruptibly
//!
//! `acquire_release` registers its release on the scope found in the
//! [`CURRENT_SCOPE`] fiber ref, which [`scoped`] provides.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::{scope, Effect};
//!
//! let program: Effect<usize, String> = scope::scoped(
//!     scope::acquire_release(open_connection(), |conn, _exit| close(conn))
//!         .flat_map(|conn| query(conn)),
//! );
//! ```

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, Op};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::fiber_ref::FiberRef;
use crate::value::{Data, Value};

/// A finalizer: given how the scope closed, release something.
pub type Finalizer = Arc<dyn Fn(Exit<(), ()>) -> Effect<(), Infallible> + Send + Sync>;

type ExitHook = Arc<dyn Fn(Exit<Value, Value>) -> Op + Send + Sync>;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

enum ScopeState {
    Open { finalizers: Vec<Finalizer> },
    Closed(Exit<(), ()>),
}

struct ScopeInner {
    id: u64,
    state: Mutex<ScopeState>,
}

/// A collection of finalizers with a lifetime.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// The scope `acquire_release` registers with.
pub static CURRENT_SCOPE: LazyLock<FiberRef<Option<Scope>>> =
    LazyLock::new(|| FiberRef::new(None));

impl Scope {
    /// Create an open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(ScopeState::Open {
                    finalizers: Vec::new(),
                }),
            }),
        }
    }

    /// Create an open scope inside an effect.
    pub fn make<E: Data>() -> Effect<Scope, E> {
        Effect::sync(Scope::new)
    }

    /// Unique id of this scope.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ScopeState::Closed(_))
    }

    /// Number of finalizers waiting for close.
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open { finalizers } => finalizers.len(),
            ScopeState::Closed(_) => 0,
        }
    }

    /// Register a finalizer. If the scope is already closed it runs now with
    /// the exit the scope closed with.
    pub fn add_finalizer<E: Data>(
        &self,
        finalizer: impl Fn(Exit<(), ()>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<(), E> {
        let scope = self.clone();
        let finalizer: Finalizer = Arc::new(finalizer);
        Effect::from_op(Op::suspend(move || {
            let closed_with = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    ScopeState::Open { finalizers } => {
                        finalizers.push(finalizer.clone());
                        None
                    }
                    ScopeState::Closed(exit) => Some(exit.clone()),
                }
            };
            match closed_with {
                None => Op::unit(),
                Some(exit) => finalizer(exit).op.uninterruptible(),
            }
        }))
    }

    /// Close the scope, running finalizers last-in first-out.
    ///
    /// Only the first close runs anything. The effect fails with the
    /// sequential combination of every finalizer failure.
    pub fn close<E: Data>(&self, exit: Exit<(), ()>) -> Effect<(), E> {
        let scope = self.clone();
        Effect::from_op(Op::suspend(move || scope.close_op(exit.clone())).uninterruptible())
    }

    pub(crate) fn close_op(&self, exit: Exit<(), ()>) -> Op {
        let finalizers = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ScopeState::Open { finalizers } => {
                    let taken = mem::take(finalizers);
                    *state = ScopeState::Closed(exit.clone());
                    taken
                }
                ScopeState::Closed(_) => return Op::unit(),
            }
        };
        tracing::trace!(scope = self.inner.id, finalizers = finalizers.len(), "closing scope");
        run_finalizers(finalizers, exit)
    }

    /// A child scope that is closed, with the same exit, when this one is.
    pub fn fork<E: Data>(&self) -> Effect<Scope, E> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new();
            let closer = child.clone();
            parent
                .add_finalizer(move |exit| closer.close(exit))
                .map_to(child)
        })
    }

    /// Run `effect` with this scope as the current scope, without closing it.
    pub fn extend<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        CURRENT_SCOPE.locally(Some(self.clone()), effect)
    }

    /// Run `effect` in this scope, then close the scope with its exit.
    pub fn use_scope<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let scope = self.clone();
        let body = self.extend(effect);
        with_exit_hook(
            body,
            Arc::new(move |exit: Exit<Value, Value>| scope.close_op(exit.as_unit())),
        )
    }
}

fn run_finalizers(finalizers: Vec<Finalizer>, exit: Exit<(), ()>) -> Op {
    let errors = Arc::new(Mutex::new(Cause::<Value>::Empty));
    let mut op = Op::unit();
    for finalizer in finalizers.into_iter().rev() {
        let exit = exit.clone();
        let errors = errors.clone();
        let step = Op::suspend(move || finalizer(exit.clone()).op).on_failure(move |cause| {
            let mut acc = errors.lock();
            *acc = mem::take(&mut *acc).then(cause);
            Op::unit()
        });
        op = op.on_success(move |_| step.clone());
    }
    op.on_success(move |_| {
        let cause = mem::take(&mut *errors.lock());
        if cause.is_empty() {
            Op::unit()
        } else {
            Op::Failure(cause)
        }
    })
}

/// Run `hook` with the erased exit of `body`, keeping `body`'s outcome.
///
/// A failure of the hook is appended to a failing body's cause and replaces
/// a successful body's value. The hook always runs, even on interruption.
pub(crate) fn with_exit_hook<A: Data, E: Data>(body: Effect<A, E>, hook: ExitHook) -> Effect<A, E> {
    Effect::uninterruptible_mask(move |restore| {
        let inner = restore.apply(body.clone()).op;
        let on_fail = hook.clone();
        let on_success = hook.clone();
        Effect::from_op(inner.on_both(
            move |cause| {
                let keep = cause.clone();
                let keep_fin = cause.clone();
                on_fail(Exit::Failure(cause)).on_both(
                    move |fin| Op::Failure(keep_fin.clone().then(fin)),
                    move |_| Op::Failure(keep.clone()),
                )
            },
            move |value| {
                let out = value.clone();
                on_success(Exit::Success(value)).on_success(move |_| Op::Succeed(out.clone()))
            },
        ))
    })
}

/// Run `effect` in a fresh scope that closes when it exits.
pub fn scoped<A: Data, E: Data>(effect: Effect<A, E>) -> Effect<A, E> {
    Effect::suspend(move || Scope::new().use_scope(effect.clone()))
}

/// Acquire a resource uninterruptibly and register its release with the
/// current scope.
///
/// Dies if there is no current scope.
pub fn acquire_release<R: Data, E: Data>(
    acquire: Effect<R, E>,
    release: impl Fn(R, Exit<(), ()>) -> Effect<(), Infallible> + Send + Sync + 'static,
) -> Effect<R, E> {
    let release = Arc::new(release);
    acquire
        .flat_map(move |resource| {
            let release = release.clone();
            Effect::from_op(Op::with_runtime(move |ctx| match ctx.get_ref(&*CURRENT_SCOPE) {
                Some(scope) => {
                    let release = release.clone();
                    let held = resource.clone();
                    let out = Value::new(resource.clone());
                    scope
                        .add_finalizer::<E>(move |exit| release(held.clone(), exit))
                        .op
                        .on_success(move |_| Op::Succeed(out.clone()))
                }
                None => Op::die("acquire_release used outside of a scope"),
            }))
        })
        .uninterruptible()
}

/// Acquire a resource, use it, and release it whatever the outcome.
///
/// Acquire and release are uninterruptible; `use_` is interruptible if the
/// caller was.
pub fn acquire_use_release<R: Data, A: Data, E: Data>(
    acquire: Effect<R, E>,
    use_: impl Fn(R) -> Effect<A, E> + Send + Sync + 'static,
    release: impl Fn(R, Exit<(), ()>) -> Effect<(), Infallible> + Send + Sync + 'static,
) -> Effect<A, E> {
    let use_ = Arc::new(use_);
    let release = Arc::new(release);
    Effect::uninterruptible_mask(move |restore| {
        let use_ = use_.clone();
        let release = release.clone();
        acquire.clone().flat_map(move |resource| {
            let release = release.clone();
            let held = resource.clone();
            let body = restore.apply(use_(resource));
            with_exit_hook(
                body,
                Arc::new(move |exit: Exit<Value, Value>| release(held.clone(), exit.as_unit()).op),
            )
        })
    })
}

/// Register a finalizer with the current scope.
pub fn add_finalizer<E: Data>(
    finalizer: impl Fn(Exit<(), ()>) -> Effect<(), Infallible> + Send + Sync + 'static,
) -> Effect<(), E> {
    let finalizer = Arc::new(finalizer);
    Effect::from_op(Op::with_runtime(move |ctx| match ctx.get_ref(&*CURRENT_SCOPE) {
        Some(scope) => {
            let finalizer = finalizer.clone();
            scope.add_finalizer::<E>(move |exit| finalizer(exit)).op
        }
        None => Op::die("add_finalizer used outside of a scope"),
    }))
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Run `finalizer` after this effect, however it exits.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        with_exit_hook(self, Arc::new(move |_| finalizer.op.clone()))
    }

    /// Run `f` with this effect's exit, however it exits.
    pub fn on_exit(
        self,
        f: impl Fn(Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        with_exit_hook(
            self,
            Arc::new(move |exit: Exit<Value, Value>| {
                f(exit.map(Value::downcast::<A>).map_error(Value::downcast::<E>)).op
            }),
        )
    }

    /// Run `f` with the interrupting fibers if this effect is interrupted.
    pub fn on_interrupt(
        self,
        f: impl Fn(HashSet<FiberId>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        with_exit_hook(
            self,
            Arc::new(move |exit: Exit<Value, Value>| match exit {
                Exit::Failure(cause) if cause.is_interrupted() => f(cause.interruptors()).op,
                _ => Op::unit(),
            }),
        )
    }

    /// Run `f` with the cause if this effect fails for any reason.
    pub fn on_error(
        self,
        f: impl Fn(Cause<E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        with_exit_hook(
            self,
            Arc::new(move |exit: Exit<Value, Value>| match exit {
                Exit::Failure(cause) => f(cause.map(Value::downcast::<E>)).op,
                Exit::Success(_) => Op::unit(),
            }),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
