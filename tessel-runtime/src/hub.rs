//! # Hubs
//!
//! A [`Hub`] broadcasts every published message to all current
//! subscribers. Each subscriber reads from its own buffer of the hub's
//! capacity; the hub's [`Strategy`] decides what `publish` does when any of
//! those buffers is full:
//!
//! - **BackPressure**: the publisher waits until every subscriber has room
//! - **Dropping**: the message is dropped for everyone and `publish`
//!   returns `false`
//! - **Sliding**: each full subscriber loses its oldest message
//!
//! Publishing is atomic with respect to other publishers, so all
//! subscribers observe messages in the same order.
//!
//! `subscribe` is scoped: the subscription is removed and shut down when
//! the enclosing scope closes.
//!
//! ```rust,ignore
//! use tessel_runtime::{scope, Dequeue, Effect, Hub};
//!
//! let program: Effect<i32> = Hub::bounded(16).flat_map(|hub: Hub<i32>| {
//!     scope::scoped(hub.subscribe().flat_map(move |sub| {
//!         hub.publish(1).zip_right(sub.take())
//!     }))
//! });
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, Op};
use crate::fiber::FiberId;
use crate::fiber_runtime::Resume;
use crate::queue::{Dequeue, Queue, SpaceListener, Strategy};
use crate::scope;
use crate::value::{Data, Value};

static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(1);

struct Publisher<A> {
    key: u64,
    message: A,
    resume: Resume,
}

struct State<A> {
    subscribers: BTreeMap<u64, Queue<A>>,
    publishers: VecDeque<Publisher<A>>,
    shutdown: bool,
    shutdown_waiters: Vec<Resume>,
    next_key: u64,
}

struct Inner<A> {
    id: u64,
    capacity: Option<usize>,
    strategy: Strategy,
    state: Mutex<State<A>>,
}

enum Published {
    Done(bool),
    Full,
    Shutdown,
}

fn interrupted(id: FiberId) -> Op {
    Op::Failure(Cause::interrupt(id))
}

impl<A: Data> Inner<A> {
    fn is_full(&self, state: &State<A>) -> bool {
        self.capacity
            .map_or(false, |cap| state.subscribers.values().any(|q| q.len() >= cap))
    }

    fn try_publish(&self, state: &mut State<A>, message: &A) -> Published {
        if state.shutdown {
            return Published::Shutdown;
        }
        // Parked publishers go first.
        if !state.publishers.is_empty() {
            return Published::Full;
        }
        if let Some(cap) = self.capacity {
            let full: Vec<&Queue<A>> = state.subscribers.values().filter(|q| q.len() >= cap).collect();
            if !full.is_empty() {
                match self.strategy {
                    Strategy::BackPressure => return Published::Full,
                    Strategy::Dropping => return Published::Done(false),
                    Strategy::Sliding => full.iter().for_each(|q| q.unsafe_evict()),
                }
            }
        }
        for queue in state.subscribers.values() {
            queue.unsafe_push(message.clone());
        }
        Published::Done(true)
    }

    /// Hand freed space to parked publishers, oldest first.
    fn wake_publishers(&self) {
        let mut state = self.state.lock();
        while !state.shutdown && !self.is_full(&state) {
            let Some(publisher) = state.publishers.pop_front() else {
                break;
            };
            if publisher.resume.try_resume(Op::Succeed(Value::new(true))) {
                for queue in state.subscribers.values() {
                    queue.unsafe_push(publisher.message.clone());
                }
            }
        }
    }

    fn shutdown_as(&self, by: FiberId) {
        let (subscribers, publishers, waiters) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            (
                mem::take(&mut state.subscribers),
                mem::take(&mut state.publishers),
                mem::take(&mut state.shutdown_waiters),
            )
        };
        tracing::trace!(hub = self.id, subscribers = subscribers.len(), "hub shut down");
        for queue in subscribers.values() {
            queue.unsafe_shutdown(by.clone());
        }
        for publisher in publishers {
            publisher.resume.resume(interrupted(by.clone()));
        }
        for waiter in waiters {
            waiter.resume(Op::unit());
        }
    }
}

fn publish_op<A: Data>(inner: Arc<Inner<A>>, message: A, id: FiberId) -> Op {
    let published = inner.try_publish(&mut inner.state.lock(), &message);
    match published {
        Published::Done(accepted) => Op::Succeed(Value::new(accepted)),
        Published::Shutdown => interrupted(id),
        Published::Full => Op::Async {
            register: Arc::new(move |resume: Resume| {
                let parked = {
                    let mut state = inner.state.lock();
                    match inner.try_publish(&mut state, &message) {
                        Published::Full => {
                            let key = state.next_key;
                            state.next_key += 1;
                            state.publishers.push_back(Publisher {
                                key,
                                message: message.clone(),
                                resume: resume.clone(),
                            });
                            Ok(key)
                        }
                        Published::Done(accepted) => Err(Op::Succeed(Value::new(accepted))),
                        Published::Shutdown => Err(interrupted(id.clone())),
                    }
                };
                match parked {
                    Ok(key) => {
                        let inner = inner.clone();
                        Some(Op::sync_unit(move || {
                            inner.state.lock().publishers.retain(|p| p.key != key);
                        }))
                    }
                    Err(op) => {
                        resume.resume(op);
                        None
                    }
                }
            }),
            blocking_on: FiberId::None,
        },
    }
}

/// A broadcast channel to any number of subscribers.
pub struct Hub<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

impl<A: Data> Hub<A> {
    fn unchecked(capacity: Option<usize>, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed),
                capacity,
                strategy,
                state: Mutex::new(State {
                    subscribers: BTreeMap::new(),
                    publishers: VecDeque::new(),
                    shutdown: false,
                    shutdown_waiters: Vec::new(),
                    next_key: 0,
                }),
            }),
        }
    }

    /// A bounded hub with the given strategy. Dies if `capacity` is zero.
    pub fn with_strategy<E: Data>(capacity: usize, strategy: Strategy) -> Effect<Self, E> {
        Effect::suspend(move || {
            if capacity == 0 {
                Effect::die("hub capacity must be positive")
            } else {
                Effect::succeed(Self::unchecked(Some(capacity), strategy))
            }
        })
    }

    /// A bounded back-pressured hub.
    pub fn bounded<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::BackPressure)
    }

    /// A bounded hub that drops messages when any subscriber is full.
    pub fn dropping<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// A bounded hub that evicts old messages from full subscribers.
    pub fn sliding<E: Data>(capacity: usize) -> Effect<Self, E> {
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// A hub without a capacity limit.
    pub fn unbounded<E: Data>() -> Effect<Self, E> {
        Effect::sync(|| Self::unchecked(None, Strategy::BackPressure))
    }

    /// Per-subscriber capacity, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Publish to every current subscriber.
    ///
    /// With no subscribers the message is discarded and `true` returned.
    pub fn publish<E: Data>(&self, message: A) -> Effect<bool, E> {
        let inner = self.inner.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            publish_op(inner.clone(), message.clone(), ctx.id())
        }))
    }

    /// Publish messages in order; `false` if any was dropped.
    pub fn publish_all<E: Data>(&self, messages: impl IntoIterator<Item = A>) -> Effect<bool, E> {
        let hub = self.clone();
        let messages: Vec<A> = messages.into_iter().collect();
        Effect::for_each(messages, move |message| hub.publish(message))
            .map(|accepted: Vec<bool>| accepted.into_iter().all(|a| a))
    }

    /// Subscribe for the lifetime of the current scope.
    ///
    /// Only messages published after subscribing are received. Dies
    /// outside a scope; interrupted if the hub is shut down.
    pub fn subscribe<E: Data>(&self) -> Effect<Subscription<A>, E> {
        let hub = self.clone();
        scope::acquire_release(
            Effect::from_op(Op::with_runtime(move |ctx| match hub.unsafe_subscribe() {
                Some(subscription) => Op::Succeed(Value::new(subscription)),
                None => interrupted(ctx.id()),
            })),
            |subscription: Subscription<A>, _exit| subscription.unsubscribe(),
        )
    }

    fn unsafe_subscribe(&self) -> Option<Subscription<A>> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return None;
        }
        let key = state.next_key;
        state.next_key += 1;
        let hub: Weak<Inner<A>> = Arc::downgrade(&self.inner);
        let on_space: SpaceListener = Arc::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.wake_publishers();
            }
        });
        let queue = Queue::unchecked(None, Strategy::BackPressure, Some(on_space));
        state.subscribers.insert(key, queue.clone());
        Some(Subscription {
            key,
            queue,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count<E: Data>(&self) -> Effect<usize, E> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().subscribers.len())
    }

    /// Messages buffered by the most backed-up subscriber.
    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        let inner = self.inner.clone();
        Effect::sync(move || {
            let state = inner.state.lock();
            state.subscribers.values().map(|q| q.len()).max().unwrap_or(0)
        })
    }

    /// Whether the hub has been shut down.
    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().shutdown)
    }

    /// Suspend until the hub is shut down.
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

    /// Shut down the hub and every subscription. Idempotent.
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
}

/// One subscriber's view of a [`Hub`]; read it through [`Dequeue`].
pub struct Subscription<A> {
    key: u64,
    queue: Queue<A>,
    hub: Weak<Inner<A>>,
}

impl<A> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            queue: self.queue.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl<A: Data> Subscription<A> {
    /// Leave the hub and shut this subscription down.
    ///
    /// Publishers waiting on this subscriber are released.
    pub fn unsubscribe<E: Data>(&self) -> Effect<(), E> {
        let subscription = self.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            if let Some(hub) = subscription.hub.upgrade() {
                hub.state.lock().subscribers.remove(&subscription.key);
                subscription.queue.unsafe_shutdown(ctx.id());
                hub.wake_publishers();
            } else {
                subscription.queue.unsafe_shutdown(ctx.id());
            }
            Op::unit()
        }))
    }
}

impl<A: Data> Dequeue<A> for Subscription<A> {
    fn take<E: Data>(&self) -> Effect<A, E> {
        self.queue.take()
    }

    fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.queue.take_all()
    }

    fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        self.queue.take_up_to(max)
    }

    fn take_between<E: Data>(&self, min: usize, max: usize) -> Effect<Vec<A>, E> {
        self.queue.take_between(min, max)
    }

    fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        self.queue.poll()
    }

    fn size<E: Data>(&self) -> Effect<isize, E> {
        self.queue.size()
    }

    fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        self.queue.is_shutdown()
    }

    fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        self.queue.await_shutdown()
    }

    fn shutdown<E: Data>(&self) -> Effect<(), E> {
        self.unsubscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::scope::{scoped, Scope};
    use std::convert::Infallible;
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_every_subscriber_receives_in_order() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::bounded::<Infallible>(8)).unwrap();
        let h = hub.clone();
        let eff: Effect<(Vec<i32>, Vec<i32>)> = scoped(hub.subscribe().zip(hub.subscribe()).flat_map(
            move |(a, b): (Subscription<i32>, Subscription<i32>)| {
                h.publish_all(vec![1, 2, 3])
                    .zip_right(a.take_all().zip(b.take_all()))
            },
        ));
        assert_eq!(rt.run_sync(eff).unwrap(), (vec![1, 2, 3], vec![1, 2, 3]));
    }

    #[test]
    fn test_publish_without_subscribers_succeeds() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::bounded::<Infallible>(1)).unwrap();
        assert!(rt.run_sync(hub.publish::<Infallible>(1)).unwrap());
        assert_eq!(rt.run_sync(hub.size::<Infallible>()).unwrap(), 0);
    }

    #[test]
    fn test_subscription_removed_when_scope_closes() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::unbounded::<Infallible>()).unwrap();
        let h = hub.clone();
        let inside: Effect<usize> = scoped(hub.subscribe().flat_map(move |_sub| h.subscriber_count()));
        assert_eq!(rt.run_sync(inside).unwrap(), 1);
        assert_eq!(rt.run_sync(hub.subscriber_count::<Infallible>()).unwrap(), 0);
    }

    #[test]
    fn test_dropping_hub_drops_for_everyone() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::dropping::<Infallible>(1)).unwrap();
        let scope = Scope::new();
        let sub = rt.run_sync(scope.extend(hub.subscribe::<Infallible>())).unwrap();
        let eff: Effect<(bool, bool, Vec<i32>)> = hub
            .publish(1)
            .zip(hub.publish(2))
            .zip_with(sub.take_all(), |(a, b), all| (a, b, all));
        assert_eq!(rt.run_sync(eff).unwrap(), (true, false, vec![1]));
        rt.run_sync(scope.close::<Infallible>(crate::exit::Exit::Success(()))).unwrap();
    }

    #[test]
    fn test_sliding_hub_keeps_latest() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::sliding::<Infallible>(2)).unwrap();
        let scope = Scope::new();
        let sub = rt.run_sync(scope.extend(hub.subscribe::<Infallible>())).unwrap();
        rt.run_sync(hub.publish_all::<Infallible>(vec![1, 2, 3])).unwrap();
        assert_eq!(rt.run_sync(sub.take_all::<Infallible>()).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_back_pressure_waits_for_slowest_subscriber() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::bounded::<Infallible>(1)).unwrap();
        let scope = Scope::new();
        let sub = rt.run_sync(scope.extend(hub.subscribe::<Infallible>())).unwrap();
        rt.run_sync(hub.publish::<Infallible>(1)).unwrap();
        let publisher = rt.run_fork(hub.publish::<Infallible>(2));
        std::thread::sleep(Duration::from_millis(30));
        assert!(publisher.unsafe_poll().is_none());
        assert_eq!(rt.run_promise(sub.take::<Infallible>()).wait().unwrap(), 1);
        assert!(rt.run_promise(publisher.join()).wait().unwrap());
        assert_eq!(rt.run_promise(sub.take::<Infallible>()).wait().unwrap(), 2);
    }

    #[test]
    fn test_parked_publishers_resume_in_arrival_order() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::bounded::<Infallible>(1)).unwrap();
        let scope = Scope::new();
        let sub = rt.run_sync(scope.extend(hub.subscribe::<Infallible>())).unwrap();
        rt.run_sync(hub.publish::<Infallible>(0)).unwrap();

        let mut publishers = Vec::new();
        for n in 1..=4 {
            let publisher = rt.run_fork(hub.publish::<Infallible>(n));
            for _ in 0..500 {
                if publisher.status().is_suspended() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(publisher.status().is_suspended());
            publishers.push(publisher);
        }

        let taken = rt.run_promise(sub.take_between::<Infallible>(5, 5)).wait().unwrap();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
        for publisher in publishers {
            assert!(rt.run_promise(publisher.join()).wait().unwrap());
        }
    }

    #[test]
    fn test_shutdown_interrupts_subscribers() {
        let rt = rt();
        let hub: Hub<i32> = rt.run_sync(Hub::unbounded::<Infallible>()).unwrap();
        let scope = Scope::new();
        let sub = rt.run_sync(scope.extend(hub.subscribe::<Infallible>())).unwrap();
        let taker = rt.run_fork(sub.take::<Infallible>());
        std::thread::sleep(Duration::from_millis(20));
        rt.run_sync(hub.shutdown::<Infallible>()).unwrap();
        let exit = rt.run_promise(taker.await_exit::<Infallible>()).wait().unwrap();
        assert!(exit.is_interrupted());
        assert!(rt.run_sync(hub.is_shutdown::<Infallible>()).unwrap());
        assert!(rt.run_sync_exit(scope.extend(hub.subscribe::<Infallible>())).is_interrupted());
    }
}
