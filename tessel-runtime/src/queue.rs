//! # Queues
//!
//! A fiber-safe FIFO queue with a fixed overflow strategy:
//!
//! | Strategy | `offer` on a full queue |
//! |----------|-------------------------|
//! | [`Strategy::BackPressure`] | suspends until a `take` frees space |
//! | [`Strategy::Dropping`] | discards the new element, returns `false` |
//! | [`Strategy::Sliding`] | evicts the oldest element, returns `true` |
//!
//! ## Design
//!
//! - One mutex guards the buffer and both wait lists
//! - Whichever of `offer`/`take` arrives second completes the parked side
//!   directly; a value offered to a waiting taker never enters the buffer
//! - Parked fibers are resumed through a one-shot claim, so an element is
//!   never handed to a taker that was interrupted in the meantime
//! - `shutdown` is terminal: parked and later callers are interrupted
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::{Effect, Queue};
//!
//! let program: Effect<Vec<i32>> = Queue::bounded(5).flat_map(|q: Queue<i32>| {
//!     q.offer(1).zip_right(q.offer(2)).zip_right(q.take_up_to(2))
//! });
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, Op};
use crate::fiber::FiberId;
use crate::fiber_runtime::Resume;
use crate::value::{Data, Value};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// What `offer` does when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Suspend the offering fiber until space frees up.
    #[default]
    BackPressure,
    /// Discard the new element.
    Dropping,
    /// Discard the oldest element to make room.
    Sliding,
}

/// The offering side of a queue.
pub trait Enqueue<A: Data> {
    /// Offer one element; `false` if it was dropped.
    fn offer<E: Data>(&self, value: A) -> Effect<bool, E>;

    /// Offer elements in order; `false` if any was dropped.
    fn offer_all<E: Data>(&self, values: Vec<A>) -> Effect<bool, E>;

    /// Maximum number of buffered elements, `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Whether the queue has been shut down.
    fn is_shutdown<E: Data>(&self) -> Effect<bool, E>;

    /// Shut the queue down, interrupting parked fibers.
    fn shutdown<E: Data>(&self) -> Effect<(), E>;
}

/// The taking side of a queue.
pub trait Dequeue<A: Data> {
    /// Take the oldest element, suspending while empty.
    fn take<E: Data>(&self) -> Effect<A, E>;

    /// Take every buffered element without suspending.
    fn take_all<E: Data>(&self) -> Effect<Vec<A>, E>;

    /// Take up to `max` buffered elements without suspending.
    fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E>;

    /// Take at least `min` and at most `max` elements, suspending until
    /// `min` are available.
    fn take_between<E: Data>(&self, min: usize, max: usize) -> Effect<Vec<A>, E>;

    /// Take the oldest element if there is one.
    fn poll<E: Data>(&self) -> Effect<Option<A>, E>;

    /// Buffered elements minus waiting takers.
    fn size<E: Data>(&self) -> Effect<isize, E>;

    /// Whether the queue has been shut down.
    fn is_shutdown<E: Data>(&self) -> Effect<bool, E>;

    /// Suspend until the queue is shut down.
    fn await_shutdown<E: Data>(&self) -> Effect<(), E>;

    /// Shut the queue down, interrupting parked fibers.
    fn shutdown<E: Data>(&self) -> Effect<(), E>;
}

struct Taker {
    key: u64,
    resume: Resume,
}

struct Putter<A> {
    key: u64,
    value: A,
    resume: Resume,
}

struct State<A> {
    buffer: VecDeque<A>,
    takers: VecDeque<Taker>,
    putters: VecDeque<Putter<A>>,
    shutdown: bool,
    shutdown_waiters: Vec<Resume>,
    next_key: u64,
}

impl<A> State<A> {
    fn key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

pub(crate) type SpaceListener = Arc<dyn Fn() + Send + Sync>;

struct Inner<A> {
    id: u64,
    capacity: Option<usize>,
    strategy: Strategy,
    state: Mutex<State<A>>,
    on_space: Option<SpaceListener>,
}

enum Offered<A> {
    Accepted(bool),
    Full(A),
    Shutdown,
}

enum Taken<A> {
    Value(A),
    Empty,
    Shutdown,
}

fn interrupted(id: FiberId) -> Op {
    Op::Failure(Cause::interrupt(id))
}

impl<A: Data> Inner<A> {
    fn has_room(&self, state: &State<A>) -> bool {
        self.capacity.map_or(true, |cap| state.buffer.len() < cap)
    }

    fn try_offer(&self, state: &mut State<A>, value: A) -> Offered<A> {
        if state.shutdown {
            return Offered::Shutdown;
        }
        while let Some(taker) = state.takers.pop_front() {
            if taker.resume.try_resume(Op::Succeed(Value::new(value.clone()))) {
                return Offered::Accepted(true);
            }
        }
        if self.has_room(state) {
            state.buffer.push_back(value);
            return Offered::Accepted(true);
        }
        match self.strategy {
            Strategy::Dropping => Offered::Accepted(false),
            Strategy::Sliding => {
                state.buffer.pop_front();
                state.buffer.push_back(value);
                Offered::Accepted(true)
            }
            Strategy::BackPressure => Offered::Full(value),
        }
    }

    /// Move parked putters into freed buffer space.
    fn refill(&self, state: &mut State<A>) {
        while self.has_room(state) {
            let Some(putter) = state.putters.pop_front() else {
                break;
            };
            if putter.resume.try_resume(Op::Succeed(Value::new(true))) {
                state.buffer.push_back(putter.value);
            }
        }
    }

    fn try_take(&self, state: &mut State<A>) -> Taken<A> {
        if state.shutdown {
            return Taken::Shutdown;
        }
        match state.buffer.pop_front() {
            Some(value) => {
                self.refill(state);
                Taken::Value(value)
            }
            None => Taken::Empty,
        }
    }

    fn take_up_to(&self, state: &mut State<A>, max: usize) -> Vec<A> {
        let mut taken = Vec::new();
        while taken.len() < max {
            match state.buffer.pop_front() {
                Some(value) => taken.push(value),
                None => break,
            }
            self.refill(state);
        }
        taken
    }

    fn notify_space(&self) {
        if let Some(listener) = &self.on_space {
            listener();
        }
    }
}

/// A fiber-safe FIFO queue.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

impl<A: Data> Queue<A> {
    pub(crate) fn unchecked(capacity: Option<usize>, strategy: Strategy, on_space: Option<SpaceListener>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                strategy,
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    takers: VecDeque::new(),
                    putters: VecDeque::new(),
                    shutdown: false,
                    shutdown_waiters: Vec::new(),
                    next_key: 0,
                }),
                on_space,
            }),
        }
    }

    /// A bounded queue with the given overflow strategy.
    ///
    /// Dies if `capacity` is zero.
    pub fn with_strategy<E: Data>(capacity: usize, strategy: Strategy) -> Effect<Self, E> {
        Effect::suspend(move || {
            if capacity == 0 {
                Effect::die("queue capacity must be positive")
            } else {
                Effect::succeed(Self::unchecked(Some(capacity), strategy, None))
            }
        })
    }

    /// A bounded back-pressured queue.
    pub fn bounded<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::BackPressure)
    }

    /// A bounded queue that drops new elements when full.
    pub fn dropping<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// A bounded queue that evicts the oldest element when full.
    pub fn sliding<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// A queue without a capacity limit.
    pub fn unbounded<E: Data>() -> Effect<Self, E> {
        Effect::sync(|| Self::unchecked(None, Strategy::BackPressure, None))
    }

    /// Maximum number of buffered elements, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// The overflow strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    /// Offer one element.
    ///
    /// Returns `false` only for a dropping queue that is full.
    pub fn offer<E: Data>(&self, value: A) -> Effect<bool, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            let id = ctx.id();
            let offered = inner.try_offer(&mut inner.state.lock(), value.clone());
            match offered {
                Offered::Accepted(accepted) => Op::Succeed(Value::new(accepted)),
                Offered::Shutdown => interrupted(id),
                Offered::Full(value) => park_putter(inner.clone(), value, id),
            }
        }))
    }

    /// Offer elements in order, suspending as needed.
    ///
    /// Returns `false` if any element was dropped.
    pub fn offer_all<E: Data>(&self, values: impl IntoIterator<Item = A>) -> Effect<bool, E> {
        let queue = self.clone();
        let values: Vec<A> = values.into_iter().collect();
        Effect::for_each(values, move |value| queue.offer(value))
            .map(|accepted: Vec<bool>| accepted.into_iter().all(|a| a))
    }

    /// Take the oldest element, suspending while the queue is empty.
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            let id = ctx.id();
            let taken = inner.try_take(&mut inner.state.lock());
            match taken {
                Taken::Value(value) => {
                    inner.notify_space();
                    Op::Succeed(Value::new(value))
                }
                Taken::Shutdown => interrupted(id),
                Taken::Empty => park_taker(inner.clone(), id),
            }
        }))
    }

    /// Take up to `max` buffered elements without suspending.
    pub fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            let taken = {
                let mut state = inner.state.lock();
                if state.shutdown {
                    return interrupted(ctx.id());
                }
                inner.take_up_to(&mut state, max)
            };
            if !taken.is_empty() {
                inner.notify_space();
            }
            Op::Succeed(Value::new(taken))
        }))
    }

    /// Take every buffered element without suspending.
    pub fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    /// Take between `min` and `max` elements, suspending until at least
    /// `min` have been taken.
    pub fn take_between<E: Data>(&self, min: usize, max: usize) -> Effect<Vec<A>, E> {
        let min = min.min(max);
        let queue = self.clone();
        self.take_up_to(max).flat_map(move |taken: Vec<A>| {
            if taken.len() >= min {
                return Effect::succeed(taken);
            }
            let queue = queue.clone();
            queue.take().flat_map(move |next: A| {
                let mut prefix = taken.clone();
                prefix.push(next);
                let got = prefix.len();
                queue
                    .take_between(min.saturating_sub(got), max - got)
                    .map(move |rest: Vec<A>| {
                        let mut all = prefix.clone();
                        all.extend(rest);
                        all
                    })
            })
        })
    }

    /// Take the oldest element if there is one, without suspending.
    pub fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        self.take_up_to(1).map(|mut taken: Vec<A>| taken.pop())
    }

    /// Buffered elements plus parked offers, minus parked takers.
    pub fn size<E: Data>(&self) -> Effect<isize, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            let state = inner.state.lock();
            if state.shutdown {
                return interrupted(ctx.id());
            }
            let size = state.buffer.len() as isize + state.putters.len() as isize
                - state.takers.len() as isize;
            Op::Succeed(Value::new(size))
        }))
    }

    /// Whether `size` is zero or less.
    pub fn is_empty<E: Data>(&self) -> Effect<bool, E> {
        self.size().map(|size| size <= 0)
    }

    /// Whether `size` has reached the capacity.
    pub fn is_full<E: Data>(&self) -> Effect<bool, E> {
        let capacity = self.inner.capacity;
        self.size().map(move |size| match capacity {
            Some(cap) => size >= cap as isize,
            None => false,
        })
    }

    /// Whether the queue has been shut down.
    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().shutdown)
    }

    /// Suspend until the queue is shut down.
    pub fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::Async {
            register: Arc::new(move |resume: Resume| {
                let mut state = inner.state.lock();
                if state.shutdown {
                    drop(state);
                    resume.resume(Op::unit());
                } else {
                    state.shutdown_waiters.push(resume);
                }
                None
            }),
            blocking_on: FiberId::None,
        })
    }

    /// Shut the queue down. Parked takers and putters are interrupted, as is
    /// every later operation. Idempotent.
    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        let inner = self.inner.clone();
        Effect::from_op(
            Op::with_runtime(move |ctx| {
                inner.shutdown_as(ctx.id());
                Op::unit()
            })
            .uninterruptible(),
        )
    }

    pub(crate) fn unsafe_shutdown(&self, by: FiberId) {
        self.inner.shutdown_as(by);
    }

    /// Push without capacity checks or suspension.
    ///
    /// Used by hubs, which enforce capacity themselves. Returns `false` if
    /// the queue is shut down.
    pub(crate) fn unsafe_push(&self, value: A) -> bool {
        let offered = self.inner.try_offer(&mut self.inner.state.lock(), value);
        !matches!(offered, Offered::Shutdown)
    }

    /// Drop the oldest buffered element.
    pub(crate) fn unsafe_evict(&self) {
        self.inner.state.lock().buffer.pop_front();
    }

    /// Number of buffered elements.
    pub(crate) fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }
}

impl<A: Data> Inner<A> {
    fn shutdown_as(&self, by: FiberId) {
        let (takers, putters, waiters) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.buffer.clear();
            (
                mem::take(&mut state.takers),
                mem::take(&mut state.putters),
                mem::take(&mut state.shutdown_waiters),
            )
        };
        tracing::trace!(
            queue = self.id,
            takers = takers.len(),
            putters = putters.len(),
            "queue shut down"
        );
        for taker in takers {
            taker.resume.resume(interrupted(by.clone()));
        }
        for putter in putters {
            putter.resume.resume(interrupted(by.clone()));
        }
        for waiter in waiters {
            waiter.resume(Op::unit());
        }
    }
}

fn park_putter<A: Data>(inner: Arc<Inner<A>>, value: A, id: FiberId) -> Op {
    Op::Async {
        register: Arc::new(move |resume: Resume| {
            let parked = {
                let mut state = inner.state.lock();
                match inner.try_offer(&mut state, value.clone()) {
                    Offered::Full(value) => {
                        let key = state.key();
                        state.putters.push_back(Putter {
                            key,
                            value,
                            resume: resume.clone(),
                        });
                        Ok(key)
                    }
                    Offered::Accepted(accepted) => Err(Op::Succeed(Value::new(accepted))),
                    Offered::Shutdown => Err(interrupted(id.clone())),
                }
            };
            match parked {
                Ok(key) => {
                    let inner = inner.clone();
                    Some(Op::sync_unit(move || {
                        inner.state.lock().putters.retain(|p| p.key != key);
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
}

fn park_taker<A: Data>(inner: Arc<Inner<A>>, id: FiberId) -> Op {
    Op::Async {
        register: Arc::new(move |resume: Resume| {
            let parked = {
                let mut state = inner.state.lock();
                match inner.try_take(&mut state) {
                    Taken::Empty => {
                        let key = state.key();
                        state.takers.push_back(Taker {
                            key,
                            resume: resume.clone(),
                        });
                        Ok(key)
                    }
                    Taken::Value(value) => Err(Some(Op::Succeed(Value::new(value)))),
                    Taken::Shutdown => Err(None),
                }
            };
            match parked {
                Ok(key) => {
                    let inner = inner.clone();
                    Some(Op::sync_unit(move || {
                        inner.state.lock().takers.retain(|t| t.key != key);
                    }))
                }
                Err(Some(op)) => {
                    inner.notify_space();
                    resume.resume(op);
                    None
                }
                Err(None) => {
                    resume.resume(interrupted(id.clone()));
                    None
                }
            }
        }),
        blocking_on: FiberId::None,
    }
}

impl<A: Data> Enqueue<A> for Queue<A> {
    fn offer<E: Data>(&self, value: A) -> Effect<bool, E> {
        Queue::offer(self, value)
    }

    fn offer_all<E: Data>(&self, values: Vec<A>) -> Effect<bool, E> {
        Queue::offer_all(self, values)
    }

    fn capacity(&self) -> Option<usize> {
        Queue::capacity(self)
    }

    fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        Queue::is_shutdown(self)
    }

    fn shutdown<E: Data>(&self) -> Effect<(), E> {
        Queue::shutdown(self)
    }
}

impl<A: Data> Dequeue<A> for Queue<A> {
    fn take<E: Data>(&self) -> Effect<A, E> {
        Queue::take(self)
    }

    fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        Queue::take_all(self)
    }

    fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        Queue::take_up_to(self, max)
    }

    fn take_between<E: Data>(&self, min: usize, max: usize) -> Effect<Vec<A>, E> {
        Queue::take_between(self, min, max)
    }

    fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        Queue::poll(self)
    }

    fn size<E: Data>(&self) -> Effect<isize, E> {
        Queue::size(self)
    }

    fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        Queue::is_shutdown(self)
    }

    fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        Queue::await_shutdown(self)
    }

    fn shutdown<E: Data>(&self) -> Effect<(), E> {
        Queue::shutdown(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
