//! # Deferred
//!
//! A [`Deferred`] is a single-assignment variable fibers can wait on.
//!
//! - The first completion wins; later ones return `false` and change nothing
//! - A completion is an effect: every waiter, present and future, runs it
//! - Waiting is interruptible; an interrupted waiter is removed from the
//!   wait list
//!
//! ```rust,ignore
//! use tessel_runtime::{Deferred, Effect};
//!
//! let program: Effect<i32> = Deferred::<i32>::make().flat_map(|d| {
//!     let waiter = d.await_();
//!     d.succeed::<Infallible>(7).zip_right(waiter)
//! });
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{Effect, Op};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::fiber_runtime::Resume;
use crate::value::{Data, Value};

static NEXT_DEFERRED_ID: AtomicU64 = AtomicU64::new(1);

enum State {
    Pending {
        waiters: HashMap<u64, Resume>,
        next_key: u64,
    },
    Done(Op),
}

struct Inner {
    id: u64,
    state: Mutex<State>,
}

/// A single-assignment variable holding an `Effect<A, E>`.
pub struct Deferred<A, E = Infallible> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Deferred")
            .field("id", &self.inner.id)
            .field("done", &done)
            .finish()
    }
}

impl<A: Data, E: Data> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Data, E: Data> Deferred<A, E> {
    /// Create an empty deferred.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_DEFERRED_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::Pending {
                    waiters: HashMap::new(),
                    next_key: 0,
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Create an empty deferred inside an effect.
    pub fn make<E2: Data>() -> Effect<Self, E2> {
        Effect::sync(Self::new)
    }

    /// Wait for completion and run the completing effect.
    pub fn await_(&self) -> Effect<A, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::suspend(move || {
            if let State::Done(op) = &*inner.state.lock() {
                return op.clone();
            }
            let inner = inner.clone();
            Op::Async {
                register: Arc::new(move |resume: Resume| {
                    let parked = match &mut *inner.state.lock() {
                        State::Done(op) => Err(op.clone()),
                        State::Pending { waiters, next_key } => {
                            let key = *next_key;
                            *next_key += 1;
                            waiters.insert(key, resume.clone());
                            Ok(key)
                        }
                    };
                    match parked {
                        Ok(key) => {
                            let inner = inner.clone();
                            Some(Op::sync_unit(move || {
                                if let State::Pending { waiters, .. } = &mut *inner.state.lock() {
                                    waiters.remove(&key);
                                }
                            }))
                        }
                        Err(op) => {
                            resume.resume(op);
                            None
                        }
                    }
                }),
                blocking_on: FiberId::None,
            }
        }))
    }

    /// The completing effect, if there is one, without waiting.
    pub fn poll<E2: Data>(&self) -> Effect<Option<Effect<A, E>>, E2> {
        let inner = self.inner.clone();
        Effect::sync(move || match &*inner.state.lock() {
            State::Done(op) => Some(Effect::from_op(op.clone())),
            State::Pending { .. } => None,
        })
    }

    /// Whether the deferred has been completed.
    pub fn is_done<E2: Data>(&self) -> Effect<bool, E2> {
        let inner = self.inner.clone();
        Effect::sync(move || matches!(*inner.state.lock(), State::Done(_)))
    }

    /// Number of fibers currently waiting.
    pub fn waiter_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Pending { waiters, .. } => waiters.len(),
            State::Done(_) => 0,
        }
    }

    /// Complete with `effect` itself; each waiter runs it independently.
    pub fn complete_with<E2: Data>(&self, effect: Effect<A, E>) -> Effect<bool, E2> {
        let deferred = self.clone();
        Effect::sync(move || deferred.unsafe_complete(effect.op.clone()))
    }

    /// Run `effect` once and complete with its exit.
    pub fn complete<E2: Data>(&self, effect: Effect<A, E>) -> Effect<bool, E2> {
        let deferred = self.clone();
        effect
            .exit()
            .flat_map(move |exit| deferred.done::<Infallible>(exit))
            .widen_error()
    }

    /// Complete with an exit.
    pub fn done<E2: Data>(&self, exit: Exit<A, E>) -> Effect<bool, E2> {
        let deferred = self.clone();
        Effect::sync(move || {
            let op = Op::from_exit(
                exit.clone()
                    .map(Value::new)
                    .map_error(Value::new),
            );
            deferred.unsafe_complete(op)
        })
    }

    /// Complete with a value.
    pub fn succeed<E2: Data>(&self, value: A) -> Effect<bool, E2> {
        self.done(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail<E2: Data>(&self, error: E) -> Effect<bool, E2> {
        self.done(Exit::fail(error))
    }

    /// Complete with a cause.
    pub fn fail_cause<E2: Data>(&self, cause: Cause<E>) -> Effect<bool, E2> {
        self.done(Exit::Failure(cause))
    }

    /// Complete with a defect.
    pub fn die<E2: Data>(&self, defect: impl Into<Defect>) -> Effect<bool, E2> {
        self.done(Exit::die(defect))
    }

    /// Complete with an interruption by the calling fiber.
    pub fn interrupt<E2: Data>(&self) -> Effect<bool, E2> {
        let deferred = self.clone();
        Effect::fiber_id().flat_map(move |id| deferred.done(Exit::interrupt(id)))
    }

    /// Complete with `op`, waking every waiter. Returns `false` if already
    /// complete.
    pub(crate) fn unsafe_complete(&self, op: Op) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => {
                    let waiters = mem::take(waiters);
                    *state = State::Done(op.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter.resume(op.clone());
        }
        true
    }

    /// Complete synchronously with a value.
    pub fn unsafe_succeed(&self, value: A) -> bool {
        self.unsafe_complete(Op::Succeed(Value::new(value)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_first_completion_wins() {
        let rt = rt();
        let d: Deferred<i32> = Deferred::new();
        let eff: Effect<(bool, bool, i32)> = d
            .succeed(1)
            .zip(d.succeed(2))
            .zip_with(d.await_(), |(a, b), v| (a, b, v));
        assert_eq!(rt.run_sync(eff).unwrap(), (true, false, 1));
    }

    #[test]
    fn test_waiter_resumes_on_completion() {
        let rt = rt();
        let d: Deferred<String, String> = Deferred::new();
        let waiter = d.await_();
        let completer = d.clone();
        let eff: Effect<String, String> = waiter.fork().flat_map(move |fiber| {
            completer
                .succeed("ready".to_string())
                .delay(Duration::from_millis(10))
                .zip_right(fiber.join())
        });
        assert_eq!(rt.run_promise(eff).wait().unwrap(), "ready");
    }

    #[test]
    fn test_failure_reaches_every_waiter() {
        let rt = rt();
        let d: Deferred<i32, String> = Deferred::new();
        let eff: Effect<i32, String> = d
            .fail::<String>("nope".to_string())
            .zip_right(d.await_().either().widen_error())
            .zip_right(d.await_());
        let err = rt.run_sync(eff).unwrap_err();
        assert_eq!(err.failure(), Some(&"nope".to_string()));
    }

    #[test]
    fn test_complete_memoizes_exit() {
        let rt = rt();
        let d: Deferred<usize> = Deferred::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let effect = Effect::sync(move || c.fetch_add(1, Ordering::SeqCst) + 1);
        let eff: Effect<(usize, usize)> = d
            .complete(effect)
            .zip_right(d.await_().zip(d.await_()));
        assert_eq!(rt.run_sync(eff).unwrap(), (1, 1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_with_reruns_effect() {
        let rt = rt();
        let d: Deferred<usize> = Deferred::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let effect = Effect::sync(move || c.fetch_add(1, Ordering::SeqCst) + 1);
        let eff: Effect<(usize, usize)> = d
            .complete_with(effect)
            .zip_right(d.await_().zip(d.await_()));
        assert_eq!(rt.run_sync(eff).unwrap(), (1, 2));
    }

    #[test]
    fn test_poll_and_is_done() {
        let rt = rt();
        let d: Deferred<i32> = Deferred::new();
        assert!(!rt.run_sync(d.is_done::<Infallible>()).unwrap());
        assert!(rt.run_sync(d.poll::<Infallible>()).unwrap().is_none());
        rt.run_sync(d.succeed::<Infallible>(3)).unwrap();
        assert!(rt.run_sync(d.is_done::<Infallible>()).unwrap());
        let polled = rt.run_sync(d.poll::<Infallible>()).unwrap().unwrap();
        assert_eq!(rt.run_sync(polled).unwrap(), 3);
    }

    #[test]
    fn test_interrupted_waiter_is_removed() {
        let rt = rt();
        let d: Deferred<i32> = Deferred::new();
        let waiter = rt.run_fork(d.await_());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while d.waiter_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(d.waiter_count(), 1);
        let exit = rt.run_promise(waiter.interrupt::<Infallible>()).wait().unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(d.waiter_count(), 0);
    }
}
