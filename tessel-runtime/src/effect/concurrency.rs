//! Forking, racing, timeouts, and parallel composition.

use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Effect, Op};
use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::{typed_exit, Fiber, FiberId};
use crate::fiber_runtime::{interrupt_and_await, FiberRuntime, Resume};
use crate::value::{Data, Value};

struct RaceState {
    decided: bool,
    first_failure: Option<Cause<Value>>,
}

struct ParState {
    remaining: usize,
    results: Vec<Option<Value>>,
    failed: bool,
}

/// Run both ops on child fibers. The first success wins and the loser is
/// interrupted; if both fail the causes are combined in parallel.
fn race_op(left: Op, right: Op) -> Op {
    Op::with_runtime(move |ctx| {
        let parent = ctx.id();
        let l = ctx.fork(left.clone(), false, None);
        let r = ctx.fork(right.clone(), false, None);
        let blocking_on = l.id().clone().combine(r.id().clone());
        let contestants = [l, r];
        Op::Async {
            register: Arc::new(move |resume: Resume| {
                let state = Arc::new(Mutex::new(RaceState {
                    decided: false,
                    first_failure: None,
                }));
                for (i, fiber) in contestants.iter().enumerate() {
                    let winner = fiber.clone();
                    let loser = contestants[1 - i].clone();
                    let state = state.clone();
                    let resume = resume.clone();
                    let by = parent.clone();
                    fiber.add_observer(Box::new(move |exit: &Exit<Value, Value>| {
                        let mut st = state.lock();
                        if st.decided {
                            return;
                        }
                        match exit {
                            Exit::Success(value) => {
                                st.decided = true;
                                drop(st);
                                let value = value.clone();
                                let winner = winner.clone();
                                let inherit = Op::with_runtime(move |ctx| {
                                    if let Some(patch) = winner.refs_patch() {
                                        ctx.apply_patch(&patch);
                                    }
                                    Op::Succeed(value.clone())
                                });
                                resume.resume(
                                    interrupt_and_await(vec![loser.clone()], by.clone())
                                        .on_success(move |_| inherit.clone()),
                                );
                            }
                            Exit::Failure(cause) => match st.first_failure.take() {
                                None => st.first_failure = Some(cause.clone()),
                                Some(first) => {
                                    st.decided = true;
                                    drop(st);
                                    resume.resume(Op::Failure(first.both(cause.clone())));
                                }
                            },
                        }
                    }));
                }
                Some(interrupt_and_await(contestants.to_vec(), parent.clone()))
            }),
            blocking_on: blocking_on.clone(),
        }
    })
}

/// Run every op on its own child fiber, succeeding with all results in
/// order. The first failure interrupts the remaining siblings.
pub(crate) fn all_par(ops: Vec<Op>) -> Op {
    Op::with_runtime(move |ctx| {
        if ops.is_empty() {
            return Op::Succeed(Value::new(Vec::<Value>::new()));
        }
        let parent = ctx.id();
        let fibers: Vec<Arc<FiberRuntime>> = ops
            .iter()
            .map(|op| ctx.fork(op.clone(), false, None))
            .collect();
        let cleanup = fibers.clone();
        let cleanup_by = parent.clone();
        let wait = Op::Async {
            register: Arc::new(move |resume: Resume| {
                let state = Arc::new(Mutex::new(ParState {
                    remaining: fibers.len(),
                    results: vec![None; fibers.len()],
                    failed: false,
                }));
                for (i, fiber) in fibers.iter().enumerate() {
                    let state = state.clone();
                    let resume = resume.clone();
                    fiber.add_observer(Box::new(move |exit: &Exit<Value, Value>| {
                        let mut st = state.lock();
                        if st.failed {
                            return;
                        }
                        match exit {
                            Exit::Success(value) => {
                                st.results[i] = Some(value.clone());
                                st.remaining -= 1;
                                if st.remaining == 0 {
                                    let out: Vec<Value> = st.results.drain(..).flatten().collect();
                                    drop(st);
                                    resume.resume(Op::Succeed(Value::new(out)));
                                }
                            }
                            Exit::Failure(cause) => {
                                st.failed = true;
                                drop(st);
                                resume.resume(Op::Failure(cause.clone()));
                            }
                        }
                    }));
                }
                Some(interrupt_and_await(fibers.clone(), parent.clone()))
            }),
            blocking_on: FiberId::None,
        };
        wait.on_failure(move |cause| {
            interrupt_and_await(cleanup.clone(), cleanup_by.clone())
                .uninterruptible()
                .on_success(move |_| Op::Failure(cause.clone()))
        })
    })
}

fn downcast_all<A: Data>(values: Value) -> Vec<A> {
    values
        .downcast::<Vec<Value>>()
        .into_iter()
        .map(Value::downcast::<A>)
        .collect()
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Start this effect on a child fiber supervised by the current one.
    ///
    /// When the parent finishes, the child is interrupted if still running.
    #[track_caller]
    pub fn fork<E2: Data>(self) -> Effect<Fiber<A, E>, E2> {
        let location = Location::caller();
        let op = self.op;
        Effect::from_op(Op::with_runtime(move |ctx| {
            let child = ctx.fork(op.clone(), false, Some(location));
            Op::Succeed(Value::new(Fiber::<A, E>::new(child)))
        }))
    }

    /// Start this effect on a fiber owned by the runtime rather than the
    /// current fiber. It outlives its creator.
    #[track_caller]
    pub fn fork_daemon<E2: Data>(self) -> Effect<Fiber<A, E>, E2> {
        let location = Location::caller();
        let op = self.op;
        Effect::from_op(Op::with_runtime(move |ctx| {
            let child = ctx.fork(op.clone(), true, Some(location));
            Op::Succeed(Value::new(Fiber::<A, E>::new(child)))
        }))
    }

    /// Race two effects. The first to succeed wins and the other is
    /// interrupted; if both fail, both causes are kept.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        Effect::from_op(race_op(self.op, that.op))
    }

    /// Race two effects on child fibers. Whichever finishes first, however
    /// it exits, is handed to its handler together with the other fiber,
    /// which is left running.
    pub fn race_with<B: Data, E2: Data, C: Data, E3: Data>(
        self,
        that: Effect<B, E2>,
        left_done: impl Fn(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + Sync + 'static,
        right_done: impl Fn(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + Sync + 'static,
    ) -> Effect<C, E3> {
        let (left, right) = (self.op, that.op);
        let left_done = Arc::new(left_done);
        let right_done = Arc::new(right_done);
        Effect::from_op(Op::with_runtime(move |ctx| {
            let parent = ctx.id();
            let l = ctx.fork(left.clone(), false, None);
            let r = ctx.fork(right.clone(), false, None);
            let blocking_on = l.id().clone().combine(r.id().clone());
            let left_done = left_done.clone();
            let right_done = right_done.clone();
            Op::Async {
                register: Arc::new(move |resume: Resume| {
                    let decided = Arc::new(AtomicBool::new(false));
                    {
                        let (decided, resume, other, f) =
                            (decided.clone(), resume.clone(), r.clone(), left_done.clone());
                        l.add_observer(Box::new(move |exit: &Exit<Value, Value>| {
                            if decided.swap(true, Ordering::AcqRel) {
                                return;
                            }
                            let exit = typed_exit::<A, E>(exit.clone());
                            resume.resume(Op::suspend(move || f(exit.clone(), Fiber::new(other.clone())).op));
                        }));
                    }
                    {
                        let (decided, resume, other, f) =
                            (decided.clone(), resume.clone(), l.clone(), right_done.clone());
                        r.add_observer(Box::new(move |exit: &Exit<Value, Value>| {
                            if decided.swap(true, Ordering::AcqRel) {
                                return;
                            }
                            let exit = typed_exit::<B, E2>(exit.clone());
                            resume.resume(Op::suspend(move || f(exit.clone(), Fiber::new(other.clone())).op));
                        }));
                    }
                    Some(interrupt_and_await(vec![l.clone(), r.clone()], parent.clone()))
                }),
                blocking_on: blocking_on.clone(),
            }
        }))
    }

    /// Race every effect in `others` against this one.
    pub fn race_all(self, others: impl IntoIterator<Item = Effect<A, E>>) -> Effect<A, E> {
        others.into_iter().fold(self, |acc, next| acc.race(next))
    }

    /// Race against `sleep(duration)`. `None` means the timeout fired and
    /// this effect was interrupted.
    ///
    /// Whichever side finishes first decides: a failure of this effect
    /// propagates at once and the sleeper is interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.race_with(
            Effect::<(), E>::sleep(duration),
            |exit, sleeper| sleeper.interrupt::<E>().zip_right(Effect::from_exit(exit).map(Some)),
            |_, fiber| fiber.interrupt::<E>().map_to(None),
        )
    }

    /// Like [`Effect::timeout`], failing with `error` when time runs out.
    pub fn timeout_fail(self, duration: Duration, error: E) -> Effect<A, E> {
        self.timeout(duration).flat_map(move |outcome| match outcome {
            Some(a) => Effect::succeed(a),
            None => Effect::fail(error.clone()),
        })
    }

    /// Wait `duration`, then run.
    pub fn delay(self, duration: Duration) -> Effect<A, E> {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    /// Run both effects concurrently and pair their results.
    ///
    /// If either fails, the other is interrupted.
    pub fn zip_par<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        Effect::from_op(all_par(vec![self.op, that.op]).on_success(|values| {
            let mut values = values.downcast::<Vec<Value>>().into_iter();
            match (values.next(), values.next()) {
                (Some(a), Some(b)) => Op::Succeed(Value::new((a.downcast::<A>(), b.downcast::<B>()))),
                _ => Op::die("parallel zip lost a result"),
            }
        }))
    }

    /// Run both concurrently, keeping the left result.
    pub fn zip_par_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.zip_par(that).map(|(a, _)| a)
    }

    /// Run both concurrently, keeping the right result.
    pub fn zip_par_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.zip_par(that).map(|(_, b)| b)
    }
}

impl<A: Data, E: Data> Effect<Vec<A>, E> {
    /// Apply `f` to every item concurrently, keeping results in input order.
    ///
    /// The first failure interrupts the remaining fibers.
    pub fn for_each_par<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        let ops: Vec<Op> = items.into_iter().map(|item| f(item).op).collect();
        Effect::from_op(all_par(ops).on_success(|values| Op::Succeed(Value::new(downcast_all::<A>(values)))))
    }

    /// Run every effect concurrently, collecting results in input order.
    pub fn collect_all_par(effects: impl IntoIterator<Item = Effect<A, E>>) -> Self {
        Self::for_each_par(effects, |effect| effect)
    }
}

// ============================================================================
// Tests
// ============================================================================
