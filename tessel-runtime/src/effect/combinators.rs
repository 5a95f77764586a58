//! Sequencing, error handling, and repetition operators.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Effect, Op};
use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::value::{Data, Value};

fn typed_cause<E: Data>(cause: Cause<Value>) -> Cause<E> {
    cause.map(Value::downcast::<E>)
}

fn flatten_cause<E: Data>(cause: Cause<Value>) -> Cause<Value> {
    match cause {
        Cause::Fail(inner) => inner.downcast::<Cause<E>>().map(Value::new),
        Cause::Sequential(l, r) => flatten_cause::<E>(*l).then(flatten_cause::<E>(*r)),
        Cause::Parallel(l, r) => flatten_cause::<E>(*l).both(flatten_cause::<E>(*r)),
        other => other,
    }
}

fn forever_op(op: Op) -> Op {
    let again = op.clone();
    op.on_success(move |_| forever_op(again.clone()))
}

impl<A: Data, E: Data> Effect<A, E> {
    // ------------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<B, E> {
        Effect::from_op(
            self.op
                .on_success(move |v| Op::Succeed(Value::new(f(v.downcast::<A>())))),
        )
    }

    /// Replace the success value.
    pub fn map_to<B: Data>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        Effect::from_op(self.op.on_success(|_| Op::unit()))
    }

    /// Continue with an effect computed from the success value.
    pub fn flat_map<B: Data>(
        self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        Effect::from_op(self.op.on_success(move |v| f(v.downcast::<A>()).op))
    }

    /// Run both effects in sequence and pair their results.
    pub fn zip<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both effects in sequence and combine their results.
    pub fn zip_with<B: Data, C: Data>(
        self,
        that: Effect<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<C, E> {
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Run both in sequence, keeping the left result.
    pub fn zip_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.clone().map_to(a))
    }

    /// Run both in sequence, keeping the right result.
    pub fn zip_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Run a side effect on the success value, keeping the value.
    pub fn tap<X: Data>(self, f: impl Fn(A) -> Effect<X, E> + Send + Sync + 'static) -> Self {
        self.flat_map(move |a| f(a.clone()).map_to(a))
    }

    // ------------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------------

    /// Recover from a typed failure.
    ///
    /// Defects and interruptions pass through untouched.
    pub fn catch_all<E2: Data>(
        self,
        f: impl Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        Effect::from_op(self.op.on_failure(move |cause| match cause.failure_or_cause() {
            Ok(e) => f(e.downcast::<E>()).op,
            Err(rest) => Op::Failure(rest),
        }))
    }

    /// Recover from any cause, including defects and interruptions.
    pub fn catch_all_cause<E2: Data>(
        self,
        f: impl Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        Effect::from_op(self.op.on_failure(move |cause| f(typed_cause(cause)).op))
    }

    /// Recover from the first defect, if the cause contains one.
    pub fn catch_all_defect(self, f: impl Fn(Defect) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Effect::from_op(self.op.on_failure(move |cause| {
            let defect = cause.defects().first().map(|d| (*d).clone());
            match defect {
                Some(d) => f(d).op,
                None => Op::Failure(cause),
            }
        }))
    }

    /// Inspect a typed failure and fail again with the original cause.
    pub fn tap_error<X: Data>(self, f: impl Fn(E) -> Effect<X, E> + Send + Sync + 'static) -> Self {
        Effect::from_op(self.op.on_failure(move |cause| {
            match cause.clone().failure_or_cause() {
                Ok(e) => {
                    let rethrow = cause.clone();
                    f(e.downcast::<E>())
                        .op
                        .on_success(move |_| Op::Failure(rethrow.clone()))
                }
                Err(_) => Op::Failure(cause),
            }
        }))
    }

    /// Inspect any failure cause and fail again with it.
    pub fn tap_error_cause<X: Data>(
        self,
        f: impl Fn(Cause<E>) -> Effect<X, E> + Send + Sync + 'static,
    ) -> Self {
        Effect::from_op(self.op.on_failure(move |cause| {
            let rethrow = cause.clone();
            f(typed_cause(cause))
                .op
                .on_success(move |_| Op::Failure(rethrow.clone()))
        }))
    }

    /// Transform typed failures.
    pub fn map_error<E2: Data>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<A, E2> {
        Effect::from_op(self.op.on_failure(move |cause| {
            Op::Failure(cause.map(|v| Value::new(f(v.downcast::<E>()))))
        }))
    }

    /// Transform the whole failure cause.
    pub fn map_error_cause<E2: Data>(
        self,
        f: impl Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        Effect::from_op(
            self.op
                .on_failure(move |cause| Op::Failure(f(typed_cause(cause)).map(Value::new))),
        )
    }

    /// Fall back to `that` on a typed failure.
    pub fn or_else<E2: Data>(self, that: Effect<A, E2>) -> Effect<A, E2> {
        self.catch_all(move |_| that.clone())
    }

    /// Fall back to a value on a typed failure.
    pub fn or_else_succeed<E2: Data>(self, value: A) -> Effect<A, E2> {
        self.catch_all(move |_| Effect::succeed(value.clone()))
    }

    /// Expose the full cause as the typed error.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        Effect::from_op(
            self.op
                .on_failure(|cause| Op::Failure(Cause::Fail(Value::new(typed_cause::<E>(cause))))),
        )
    }

    /// Observe the outcome as a `Result`; only defects and interruptions
    /// remain as failures.
    pub fn either(self) -> Effect<Result<A, E>, Infallible> {
        Effect::from_op(self.op.on_both(
            |cause| match cause.failure_or_cause() {
                Ok(e) => Op::Succeed(Value::new(Err::<A, E>(e.downcast::<E>()))),
                Err(rest) => Op::Failure(rest),
            },
            |v| Op::Succeed(Value::new(Ok::<A, E>(v.downcast::<A>()))),
        ))
    }

    /// Observe the complete outcome. Never fails.
    pub fn exit(self) -> Effect<Exit<A, E>, Infallible> {
        Effect::from_op(self.op.on_both(
            |cause| Op::Succeed(Value::new(Exit::<A, E>::Failure(typed_cause(cause)))),
            |v| Op::Succeed(Value::new(Exit::<A, E>::Success(v.downcast::<A>()))),
        ))
    }

    /// Fold a typed failure or success into a value.
    pub fn fold<B: Data>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, Infallible> {
        Effect::from_op(self.op.on_both(
            move |cause| match cause.failure_or_cause() {
                Ok(e) => Op::Succeed(Value::new(on_failure(e.downcast::<E>()))),
                Err(rest) => Op::Failure(rest),
            },
            move |v| Op::Succeed(Value::new(on_success(v.downcast::<A>()))),
        ))
    }

    /// Continue with one of two effects depending on the outcome.
    pub fn fold_effect<B: Data, E2: Data>(
        self,
        on_failure: impl Fn(E) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        Effect::from_op(self.op.on_both(
            move |cause| match cause.failure_or_cause() {
                Ok(e) => on_failure(e.downcast::<E>()).op,
                Err(rest) => Op::Failure(rest),
            },
            move |v| on_success(v.downcast::<A>()).op,
        ))
    }

    /// Continue with one of two effects, seeing the whole cause on failure.
    pub fn fold_cause_effect<B: Data, E2: Data>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        Effect::from_op(self.op.on_both(
            move |cause| on_failure(typed_cause(cause)).op,
            move |v| on_success(v.downcast::<A>()).op,
        ))
    }

    /// Discard both the value and any typed failure.
    pub fn ignore(self) -> Effect<(), Infallible> {
        self.fold(|_| (), |_| ())
    }

    // ------------------------------------------------------------------------
    // Repetition
    // ------------------------------------------------------------------------

    /// Retry up to `n` more times on typed failure.
    pub fn retry_n(self, n: usize) -> Self {
        let again = self.clone();
        Effect::from_op(self.op.on_failure(move |cause| {
            if n == 0 || !cause.is_failure() {
                Op::Failure(cause)
            } else {
                again.clone().retry_n(n - 1).op
            }
        }))
    }

    /// Run once, then `n` more times, keeping the last value.
    pub fn repeat_n(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        let again = self.clone();
        self.flat_map(move |_| again.clone().repeat_n(n - 1))
    }

    /// Repeat until failure.
    pub fn forever<B: Data>(self) -> Effect<B, E> {
        Effect::from_op(forever_op(self.op))
    }

    /// Run only if `condition` holds.
    pub fn when(self, condition: bool) -> Effect<Option<A>, E> {
        if condition {
            self.map(Some)
        } else {
            Effect::succeed(None)
        }
    }
}

impl<A: Data, E: Data + fmt::Debug> Effect<A, E> {
    /// Turn typed failures into defects.
    pub fn or_die<E2: Data>(self) -> Effect<A, E2> {
        Effect::from_op(self.op.on_failure(|cause| {
            Op::Failure(cause.fail_to_die(|v| Defect::new(format!("{:?}", v.downcast::<E>()))))
        }))
    }
}

impl<A: Data, E: Data> Effect<A, Cause<E>> {
    /// Inverse of [`Effect::sandbox`].
    pub fn unsandbox(self) -> Effect<A, E> {
        Effect::from_op(self.op.on_failure(|cause| Op::Failure(flatten_cause::<E>(cause))))
    }
}

impl<A: Data, E: Data> Effect<Effect<A, E>, E> {
    /// Run the effect produced by this one.
    pub fn flatten(self) -> Effect<A, E> {
        self.flat_map(|inner| inner)
    }
}

impl<A: Data, E: Data> Effect<Vec<A>, E> {
    /// Apply `f` to every item in order, collecting the results.
    ///
    /// Stops at the first failure.
    pub fn for_each<T: Data>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        let items: Arc<[T]> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::from_op(Op::suspend(move || {
            let acc = Arc::new(Mutex::new(Vec::with_capacity(items.len())));
            for_each_step(items.clone(), f.clone(), acc, 0)
        }))
    }

    /// Run every effect in order, collecting the results.
    pub fn collect_all(effects: impl IntoIterator<Item = Effect<A, E>>) -> Self {
        Self::for_each(effects, |effect| effect)
    }
}

fn for_each_step<T, A, E, F>(
    items: Arc<[T]>,
    f: Arc<F>,
    acc: Arc<Mutex<Vec<A>>>,
    index: usize,
) -> Op
where
    T: Data,
    A: Data,
    E: Data,
    F: Fn(T) -> Effect<A, E> + Send + Sync + 'static,
{
    if index == items.len() {
        let out = std::mem::take(&mut *acc.lock());
        return Op::Succeed(Value::new(out));
    }
    let next = f(items[index].clone()).op;
    next.on_success(move |v| {
        acc.lock().push(v.downcast::<A>());
        for_each_step(items.clone(), f.clone(), acc.clone(), index + 1)
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_map_and_flat_map() {
        let rt = rt();
        let eff: Effect<i32> = Effect::succeed(20).flat_map(|n| Effect::sync(move || n + 1)).map(|n| n * 2);
        assert_eq!(rt.run_sync(eff).unwrap(), 42);
    }

    fn count_down(n: u64) -> Effect<u64> {
        if n == 0 {
            return Effect::succeed(0);
        }
        Effect::suspend(move || count_down(n - 1)).map(|k| k + 1)
    }

    #[test]
    fn test_deep_continuation_stack_is_stack_safe() {
        let rt = rt();
        assert_eq!(rt.run_sync(count_down(100_000)).unwrap(), 100_000);
    }

    #[test]
    fn test_clone_of_long_chain_is_shallow() {
        let rt = rt();
        let mut chain: Effect<u64> = Effect::succeed(0);
        for _ in 0..50_000 {
            chain = chain.map(|n| n + 1);
        }
        let copy = chain.clone();
        assert_eq!(rt.run_sync(copy).unwrap(), 50_000);
        assert_eq!(rt.run_sync(chain.clone().zip_with(chain.clone(), |a, b| a + b)).unwrap(), 100_000);
        assert_eq!(rt.run_sync(chain.repeat_n(2)).unwrap(), 50_000);
    }

    #[test]
    fn test_catch_all_recovers_typed_failure() {
        let rt = rt();
        let eff: Effect<i32, String> = Effect::fail("boom".to_string());
        let recovered: Effect<i32, String> = eff.catch_all(|e| Effect::succeed(e.len() as i32));
        assert_eq!(rt.run_sync(recovered).unwrap(), 4);
    }

    #[test]
    fn test_catch_all_does_not_catch_defects() {
        let rt = rt();
        let eff: Effect<i32, String> = Effect::die("bug");
        let handled: Effect<i32, String> = eff.catch_all(|_| Effect::succeed(0));
        let exit = rt.run_sync_exit(handled);
        assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
    }

    #[test]
    fn test_panic_in_map_becomes_defect() {
        let rt = rt();
        let eff: Effect<i32> = Effect::succeed(1).map(|_| -> i32 { panic!("kaboom") });
        let exit = rt.run_sync_exit(eff);
        let cause = exit.cause().cloned().unwrap_or_default();
        assert!(cause.defects()[0].message().contains("kaboom"));
    }

    #[test]
    fn test_catch_all_defect() {
        let rt = rt();
        let eff: Effect<String> = Effect::die("bad").catch_all_defect(|d| Effect::succeed(d.message().to_string()));
        assert_eq!(rt.run_sync(eff).unwrap(), "bad");
    }

    #[test]
    fn test_either_and_fold() {
        let rt = rt();
        let eff: Effect<i32, &'static str> = Effect::fail("no");
        assert_eq!(rt.run_sync(eff.clone().either()).unwrap(), Err("no"));
        assert_eq!(rt.run_sync(eff.fold(|_| -1, |n| n)).unwrap(), -1);
    }

    #[test]
    fn test_sandbox_unsandbox() {
        let rt = rt();
        let eff: Effect<i32, String> = Effect::fail("x".into());
        let sandboxed = eff.sandbox();
        let back: Effect<i32, String> = sandboxed.unsandbox();
        let exit = rt.run_sync_exit(back);
        assert_eq!(exit.cause().map(|c| c.failures().len()), Some(1));
    }

    #[test]
    fn test_or_die() {
        let rt = rt();
        let eff: Effect<i32, String> = Effect::fail("oops".into());
        let died: Effect<i32> = eff.or_die();
        let exit = rt.run_sync_exit(died);
        assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
    }

    #[test]
    fn test_tap_error_rethrows() {
        let rt = rt();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let eff: Effect<i32, String> = Effect::fail("e".into());
        let tapped = eff.tap_error(move |e| {
            let s = s.clone();
            Effect::sync(move || *s.lock() = Some(e.clone()))
        });
        assert!(rt.run_sync(tapped).is_err());
        assert_eq!(seen.lock().as_deref(), Some("e"));
    }

    #[test]
    fn test_retry_n() {
        let rt = rt();
        let attempts = Arc::new(Mutex::new(0));
        let a = attempts.clone();
        let eff: Effect<i32, String> = Effect::try_sync(move || {
            let mut n = a.lock();
            *n += 1;
            if *n < 3 {
                Err("again".to_string())
            } else {
                Ok(*n)
            }
        });
        assert_eq!(rt.run_sync(eff.retry_n(5)).unwrap(), 3);
        assert_eq!(*attempts.lock(), 3);
    }

    #[test]
    fn test_repeat_n() {
        let rt = rt();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let eff: Effect<()> = Effect::sync(move || *c.lock() += 1);
        rt.run_sync(eff.repeat_n(4)).unwrap();
        assert_eq!(*count.lock(), 5);
    }

    #[test]
    fn test_for_each_in_order() {
        let rt = rt();
        let eff: Effect<Vec<i32>> = Effect::for_each(1..=5, |n| Effect::succeed(n * 10));
        assert_eq!(rt.run_sync(eff).unwrap(), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_for_each_reruns_fresh() {
        let rt = rt();
        let eff: Effect<Vec<i32>> = Effect::collect_all(vec![Effect::succeed(1), Effect::succeed(2)]);
        assert_eq!(rt.run_sync(eff.clone()).unwrap(), vec![1, 2]);
        assert_eq!(rt.run_sync(eff).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_forever_stops_on_failure() {
        let rt = rt();
        let n = Arc::new(Mutex::new(0));
        let c = n.clone();
        let eff: Effect<(), String> = Effect::try_sync(move || {
            let mut v = c.lock();
            *v += 1;
            if *v == 10 {
                Err("done".to_string())
            } else {
                Ok(())
            }
        });
        let looped: Effect<(), String> = eff.forever();
        assert!(rt.run_sync(looped).is_err());
        assert_eq!(*n.lock(), 10);
    }
}
