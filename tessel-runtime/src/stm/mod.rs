//! # Software Transactional Memory
//!
//! An [`Stm<A, E>`] describes a transaction over [`TRef`]s. Nothing happens
//! until it is [`commit`](Stm::commit)ted, which turns it into an
//! [`Effect`]:
//!
//! 1. The transaction runs against a fresh journal. Reads see the journal
//!    first and the live ref otherwise; writes stay in the journal
//! 2. Under the global commit lock every recorded version is checked. If
//!    all are current the writes are published atomically, otherwise the
//!    attempt is thrown away and the transaction re-runs from scratch
//! 3. [`Stm::retry`] parks the fiber on every ref the attempt read; the
//!    next commit that writes one of them re-runs it
//!
//! Commits never take per-ref locks in any user-visible order, so
//! transactions compose without deadlock. Heavy contention on one ref can
//! make a long transaction re-run many times.
//!
//! A panic inside a transaction is a defect. A transaction that retries
//! without having read any ref waits until it is interrupted.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::stm::{Stm, TRef};
//!
//! let from = TRef::new(100);
//! let to = TRef::new(0);
//! let transfer: Stm<(), String> = from.get().flat_map(move |balance| {
//!     let (from, to) = (from.clone(), to.clone());
//!     if balance < 30 {
//!         Stm::fail("insufficient funds".to_string())
//!     } else {
//!         from.set(balance - 30).zip_right(to.update(|n| n + 30))
//!     }
//! });
//! runtime.run_sync(transfer.commit())?;
//! ```

/// Unwrap a successful step, returning any other outcome from the
/// enclosing transaction body.
macro_rules! tx_try {
    ($step:expr) => {
        match $step.split() {
            Ok(value) => value,
            Err(other) => return other,
        }
    };
}

pub(crate) mod journal;
mod tarray;
mod thub;
mod tmap;
mod tqueue;
mod tref;

pub use tarray::TArray;
pub use thub::{THub, TSubscription};
pub use tmap::TMap;
pub use tqueue::TQueue;
pub use tref::TRef;

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::effect::{Effect, Op};
use crate::fiber::FiberId;
use crate::fiber_runtime::Resume;
use crate::value::{Data, Value};

use journal::{next_waiter_key, Journal};

/// Outcome of running a transaction against a journal.
pub(crate) enum Tx<A, E> {
    Done(A),
    Fail(E),
    Die(Defect),
    Interrupt(FiberId),
    /// Wait for a read ref to change, then re-run.
    Retry,
    /// A read observed a torn snapshot; re-run now.
    Inconsistent,
}

impl<A, E> Tx<A, E> {
    /// Split off the success value, re-typing every other outcome.
    fn split<B>(self) -> Result<A, Tx<B, E>> {
        match self {
            Tx::Done(a) => Ok(a),
            Tx::Fail(e) => Err(Tx::Fail(e)),
            Tx::Die(d) => Err(Tx::Die(d)),
            Tx::Interrupt(id) => Err(Tx::Interrupt(id)),
            Tx::Retry => Err(Tx::Retry),
            Tx::Inconsistent => Err(Tx::Inconsistent),
        }
    }

    fn map_fail<E2>(self, f: impl FnOnce(E) -> Tx<A, E2>) -> Tx<A, E2> {
        match self {
            Tx::Done(a) => Tx::Done(a),
            Tx::Fail(e) => f(e),
            Tx::Die(d) => Tx::Die(d),
            Tx::Interrupt(id) => Tx::Interrupt(id),
            Tx::Retry => Tx::Retry,
            Tx::Inconsistent => Tx::Inconsistent,
        }
    }
}

type RunFn<A, E> = Arc<dyn Fn(&mut Journal) -> Tx<A, E> + Send + Sync>;

/// A transaction producing `A` or failing with `E`.
pub struct Stm<A, E = Infallible> {
    run: RunFn<A, E>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stm(..)")
    }
}

impl<A: Data, E: Data> Stm<A, E> {
    pub(crate) fn new(run: impl Fn(&mut Journal) -> Tx<A, E> + Send + Sync + 'static) -> Self {
        Self { run: Arc::new(run) }
    }

    pub(crate) fn run(&self, journal: &mut Journal) -> Tx<A, E> {
        (self.run)(journal)
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// A transaction that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::new(move |_| Tx::Done(value.clone()))
    }

    /// A transaction that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::new(move |_| Tx::Fail(error.clone()))
    }

    /// A transaction that dies with `defect`.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Self::new(move |_| Tx::Die(defect.clone()))
    }

    /// Interrupt the committing fiber.
    pub fn interrupt() -> Self {
        Self::new(|journal| Tx::Interrupt(journal.fiber_id().clone()))
    }

    /// Abandon this attempt and wait until a ref it read changes.
    pub fn retry() -> Self {
        Self::new(|_| Tx::Retry)
    }

    /// Run `f` inside the transaction. It may run once per attempt.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::new(move |_| Tx::Done(f()))
    }

    /// Build the transaction lazily, once per attempt.
    pub fn suspend(f: impl Fn() -> Stm<A, E> + Send + Sync + 'static) -> Self {
        Self::new(move |journal| f().run(journal))
    }

    // ------------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        Stm::new(move |journal| match self.run(journal).split() {
            Ok(a) => Tx::Done(f(a)),
            Err(other) => other,
        })
    }

    /// Replace the success value.
    pub fn map_to<B: Data>(self, value: B) -> Stm<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    /// Continue with a transaction computed from the success value.
    pub fn flat_map<B: Data>(self, f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static) -> Stm<B, E> {
        Stm::new(move |journal| match self.run(journal).split() {
            Ok(a) => f(a).run(journal),
            Err(other) => other,
        })
    }

    /// Run both, combining their results.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Stm<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Stm<C, E> {
        Stm::new(move |journal| {
            let a = match self.run(journal).split() {
                Ok(a) => a,
                Err(other) => return other,
            };
            match that.run(journal).split() {
                Ok(b) => Tx::Done(f(a, b)),
                Err(other) => other,
            }
        })
    }

    /// Run both, pairing their results.
    pub fn zip<B: Data>(self, that: Stm<B, E>) -> Stm<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both, keeping the left result.
    pub fn zip_left<B: Data>(self, that: Stm<B, E>) -> Stm<A, E> {
        self.zip_with(that, |a, _| a)
    }

    /// Run both, keeping the right result.
    pub fn zip_right<B: Data>(self, that: Stm<B, E>) -> Stm<B, E> {
        self.zip_with(that, |_, b| b)
    }

    /// Run `self` only if `condition` holds.
    pub fn when(self, condition: bool) -> Stm<Option<A>, E> {
        if condition {
            self.map(Some)
        } else {
            Stm::succeed(None)
        }
    }

    // ------------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------------

    /// Transform the failure.
    pub fn map_error<E2: Data>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Stm<A, E2> {
        Stm::new(move |journal| self.run(journal).map_fail(|e| Tx::Fail(f(e))))
    }

    /// Recover from a failure. The failed branch's writes are discarded.
    pub fn catch_all<E2: Data>(self, f: impl Fn(E) -> Stm<A, E2> + Send + Sync + 'static) -> Stm<A, E2> {
        Stm::new(move |journal| {
            let snapshot = journal.clone();
            self.run(journal).map_fail(|e| {
                journal.rollback_to(snapshot);
                f(e).run(journal)
            })
        })
    }

    /// Expose the failure as an `Err`. The failed branch's writes are
    /// discarded.
    pub fn either<E2: Data>(self) -> Stm<Result<A, E>, E2> {
        Stm::new(move |journal| {
            let snapshot = journal.clone();
            match self.run(journal) {
                Tx::Done(a) => Tx::Done(Ok(a)),
                Tx::Fail(e) => {
                    journal.rollback_to(snapshot);
                    Tx::Done(Err(e))
                }
                Tx::Die(d) => Tx::Die(d),
                Tx::Interrupt(id) => Tx::Interrupt(id),
                Tx::Retry => Tx::Retry,
                Tx::Inconsistent => Tx::Inconsistent,
            }
        })
    }

    /// Run `that` if `self` fails or retries, discarding `self`'s writes.
    ///
    /// If both retry, the transaction waits on the refs read by either.
    pub fn or_else<E2: Data>(self, that: Stm<A, E2>) -> Stm<A, E2> {
        Stm::new(move |journal| {
            let snapshot = journal.clone();
            match self.run(journal) {
                Tx::Done(a) => Tx::Done(a),
                Tx::Fail(_) | Tx::Retry => {
                    journal.rollback_to(snapshot);
                    that.run(journal)
                }
                Tx::Die(d) => Tx::Die(d),
                Tx::Interrupt(id) => Tx::Interrupt(id),
                Tx::Inconsistent => Tx::Inconsistent,
            }
        })
    }

    /// Run `that` only if `self` retries, discarding `self`'s writes.
    pub fn or_try(self, that: Stm<A, E>) -> Stm<A, E> {
        Stm::new(move |journal| {
            let snapshot = journal.clone();
            match self.run(journal) {
                Tx::Retry => {
                    journal.rollback_to(snapshot);
                    that.run(journal)
                }
                other => other,
            }
        })
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Run the transaction atomically as an effect.
    pub fn commit(&self) -> Effect<A, E> {
        let stm = self.clone();
        Effect::from_op(Op::with_runtime(move |ctx| attempt(stm.clone(), ctx.id())))
    }
}

impl<A: Data, E: Data> Stm<Vec<A>, E> {
    /// Run `f` for each item in order, collecting the results.
    pub fn for_each<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Stm<A, E> + Send + Sync + 'static,
    ) -> Self {
        let items: Arc<[T]> = items.into_iter().collect();
        Stm::new(move |journal| {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                match f(item.clone()).run(journal).split() {
                    Ok(a) => out.push(a),
                    Err(other) => return other,
                }
            }
            Tx::Done(out)
        })
    }
}

impl<E: Data> Stm<(), E> {
    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }
}

fn attempt<A: Data, E: Data>(stm: Stm<A, E>, fiber_id: FiberId) -> Op {
    let mut attempts = 0u64;
    loop {
        attempts += 1;
        let mut journal = Journal::new(fiber_id.clone());
        let (op, publish) = match stm.run(&mut journal) {
            Tx::Inconsistent => continue,
            Tx::Retry => {
                if journal.validate() {
                    return park(stm, journal);
                }
                continue;
            }
            Tx::Done(a) => (Op::Succeed(Value::new(a)), true),
            Tx::Fail(e) => (Op::Failure(Cause::fail(Value::new(e))), false),
            Tx::Die(d) => (Op::Failure(Cause::die(d)), false),
            Tx::Interrupt(id) => (Op::Failure(Cause::interrupt(id)), false),
        };
        let committed = if publish {
            journal.commit()
        } else {
            journal.validate()
        };
        if committed {
            if attempts > 1 {
                tracing::trace!(fiber = %fiber_id, attempts, "stm transaction committed after conflicts");
            }
            return op;
        }
    }
}

fn park<A: Data, E: Data>(stm: Stm<A, E>, journal: Journal) -> Op {
    let journal = Arc::new(journal);
    Op::Async {
        register: Arc::new(move |resume: Resume| {
            if journal.is_empty() {
                return None;
            }
            let key = next_waiter_key();
            let rerun = {
                let journal = journal.clone();
                let stm = stm.clone();
                Op::suspend(move || {
                    journal.unpark(key);
                    attempt(stm.clone(), journal.fiber_id().clone())
                })
            };
            if journal.park(key, &resume, rerun.clone()) {
                let journal = journal.clone();
                Some(Op::sync_unit(move || journal.unpark(key)))
            } else {
                resume.resume(rerun);
                None
            }
        }),
        blocking_on: FiberId::None,
    }
}

// ============================================================================
// Tests
// ============================================================================
