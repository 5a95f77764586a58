//! # Fibers
//!
//! Lightweight, cooperatively-scheduled units of execution.
//!
//! ## Design
//!
//! - A fiber interprets one effect description on a worker thread
//! - M:N scheduling: many fibers multiplexed over a few OS threads
//! - Fibers suspend on async operations without blocking their thread
//! - Every fiber reaches `Done` exactly once; its `Exit` is cached for late
//!   joiners
//!
//! [`Fiber<A, E>`] is the typed handle returned by `fork`. The interpreter
//! state behind it lives in [`crate::fiber_runtime`].
//!
//! ## Technical References
//!
//! - [Tokio Scheduler Design](https://tokio.rs/blog/2019-10-scheduler)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque) for work-stealing

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::effect::{Effect, Op};
use crate::exit::Exit;
use crate::fiber_runtime::{FiberRuntime, Resume};
use crate::value::{Data, Value};

/// Identity of a fiber.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FiberId {
    /// No fiber: the runtime itself, or an external caller.
    None,
    /// A live or finished fiber.
    Runtime {
        /// Process-wide unique sequence number.
        id: u64,
        /// Creation time in milliseconds since the Unix epoch.
        start_time_millis: u64,
        /// Source location of the `fork` that created the fiber, when known.
        location: Option<&'static Location<'static>>,
    },
    /// A set of fibers acting together.
    Composite(Box<FiberId>, Box<FiberId>),
}

impl FiberId {
    /// A runtime fiber id without a creation location.
    pub fn runtime(id: u64, start_time_millis: u64) -> Self {
        FiberId::Runtime {
            id,
            start_time_millis,
            location: None,
        }
    }

    /// Combine two ids; `None` is the identity.
    pub fn combine(self, other: FiberId) -> FiberId {
        match (self, other) {
            (FiberId::None, other) => other,
            (this, FiberId::None) => this,
            (this, other) => FiberId::Composite(Box::new(this), Box::new(other)),
        }
    }

    /// True for `FiberId::None`.
    pub fn is_none(&self) -> bool {
        matches!(self, FiberId::None)
    }

    /// Sequence number of a runtime fiber.
    pub fn seq(&self) -> Option<u64> {
        match self {
            FiberId::Runtime { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Every sequence number contained in this id.
    pub fn ids(&self) -> HashSet<u64> {
        let mut out = HashSet::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut HashSet<u64>) {
        match self {
            FiberId::None => {}
            FiberId::Runtime { id, .. } => {
                out.insert(*id);
            }
            FiberId::Composite(l, r) => {
                l.collect_ids(out);
                r.collect_ids(out);
            }
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberId::None => write!(f, "#none"),
            FiberId::Runtime { id, .. } => write!(f, "#{}", id),
            FiberId::Composite(l, r) => write!(f, "{}+{}", l, r),
        }
    }
}

/// Global fiber id counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh fiber id.
pub(crate) fn next_fiber_id(location: Option<&'static Location<'static>>) -> FiberId {
    let start_time_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    FiberId::Runtime {
        id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
        start_time_millis,
        location,
    }
}

/// Observable state of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Scheduled or executing on a worker.
    Running {
        /// An interruption has been delivered and is being processed.
        interrupting: bool,
    },
    /// Parked on an asynchronous operation.
    Suspended {
        /// Whether an interruption would be honored right now.
        interruptible: bool,
        /// What the fiber is waiting for.
        blocking_on: FiberId,
    },
    /// Finished; the exit is cached.
    Done,
}

impl FiberStatus {
    /// True once the fiber has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }

    /// True while parked on an async operation.
    pub fn is_suspended(&self) -> bool {
        matches!(self, FiberStatus::Suspended { .. })
    }
}

/// Typed handle to a forked fiber.
pub struct Fiber<A, E = Infallible> {
    pub(crate) inner: Arc<FiberRuntime>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", self.inner.id())
            .field("status", &self.inner.status())
            .finish()
    }
}

pub(crate) fn typed_exit<A: Data, E: Data>(exit: Exit<Value, Value>) -> Exit<A, E> {
    exit.map(Value::downcast::<A>).map_error(Value::downcast::<E>)
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn new(inner: Arc<FiberRuntime>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The fiber's identity.
    pub fn id(&self) -> FiberId {
        self.inner.id().clone()
    }

    /// Snapshot of the fiber's status.
    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    /// Identities of fibers that have requested this fiber's interruption.
    pub fn interruptors(&self) -> HashSet<FiberId> {
        self.inner.interruptors()
    }

    /// The cached exit, without suspending.
    pub fn unsafe_poll(&self) -> Option<Exit<A, E>> {
        self.inner.poll_exit().map(typed_exit)
    }

    /// The cached exit, if the fiber is done.
    pub fn poll<E2: Data>(&self) -> Effect<Option<Exit<A, E>>, E2> {
        let fiber = self.clone();
        Effect::sync(move || fiber.unsafe_poll())
    }

    /// Wait for the fiber to finish and observe its exit.
    ///
    /// Never fails: the child's failure is reported inside the `Exit`.
    pub fn await_exit<E2: Data>(&self) -> Effect<Exit<A, E>, E2> {
        let inner = self.inner.clone();
        let blocking_on = inner.id().clone();
        Effect::from_op(Op::Async {
            register: Arc::new(move |resume: Resume| {
                let key = inner.add_observer(Box::new(move |exit: &Exit<Value, Value>| {
                    let typed: Exit<A, E> = typed_exit(exit.clone());
                    resume.resume(Op::Succeed(Value::new(typed)));
                }));
                key.map(|key| {
                    let inner = inner.clone();
                    Op::sync_unit(move || inner.remove_observer(key))
                })
            }),
            blocking_on,
        })
    }

    /// Merge the fiber-ref changes the fiber made into the current fiber.
    pub fn inherit_all<E2: Data>(&self) -> Effect<(), E2> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            if let Some(patch) = inner.refs_patch() {
                ctx.apply_patch(&patch);
            }
            Op::unit()
        }))
    }

    /// Wait for the fiber, inherit its fiber refs, and adopt its outcome.
    pub fn join(&self) -> Effect<A, E> {
        let fiber = self.clone();
        self.await_exit::<E>().flat_map(move |exit| {
            fiber
                .inherit_all::<E>()
                .flat_map(move |_| Effect::from_exit(exit.clone()))
        })
    }

    /// Interrupt the fiber on behalf of the current fiber and wait for it.
    pub fn interrupt<E2: Data>(&self) -> Effect<Exit<A, E>, E2> {
        let fiber = self.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            fiber.inner.interrupt_as(ctx.id());
            fiber.await_exit::<E2>().op
        }))
    }

    /// Interrupt the fiber on behalf of `by` and wait for it.
    pub fn interrupt_as<E2: Data>(&self, by: FiberId) -> Effect<Exit<A, E>, E2> {
        let fiber = self.clone();
        Effect::suspend(move || {
            fiber.inner.interrupt_as(by.clone());
            fiber.await_exit()
        })
    }

    /// Request interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<E2: Data>(&self) -> Effect<(), E2> {
        let fiber = self.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            fiber.inner.interrupt_as(ctx.id());
            Op::unit()
        }))
    }

    /// Request interruption from outside any fiber.
    pub fn unsafe_interrupt(&self) {
        self.inner.interrupt_as(FiberId::None);
    }

    /// Number of children currently supervised by this fiber.
    pub fn child_count(&self) -> usize {
        self.inner.child_count()
    }
}

// ============================================================================
// Tests
// ============================================================================
