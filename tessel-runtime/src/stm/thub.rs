//! Transactional broadcast hubs.

use std::collections::VecDeque;
use std::fmt;

use super::{Stm, TRef, Tx};
use crate::effect::Effect;
use crate::queue::Strategy;
use crate::scope;
use crate::value::Data;

struct Subscriber<A> {
    key: u64,
    buffer: TRef<VecDeque<A>>,
}

impl<A> Clone for Subscriber<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            buffer: self.buffer.clone(),
        }
    }
}

/// A hub whose publish and subscribe compose inside transactions.
///
/// A publish reaches every subscriber or none of them.
pub struct THub<A> {
    subscribers: TRef<Vec<Subscriber<A>>>,
    next_key: TRef<u64>,
    shutdown: TRef<bool>,
    capacity: Option<usize>,
    strategy: Strategy,
}

impl<A> Clone for THub<A> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            next_key: self.next_key.clone(),
            shutdown: self.shutdown.clone(),
            capacity: self.capacity,
            strategy: self.strategy,
        }
    }
}

impl<A> fmt::Debug for THub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("THub")
            .field("capacity", &self.capacity)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<A: Data> THub<A> {
    fn make<E: Data>(capacity: Option<usize>, strategy: Strategy) -> Stm<Self, E> {
        if capacity == Some(0) {
            return Stm::die("hub capacity must be positive");
        }
        Stm::sync(move || Self {
            subscribers: TRef::new(Vec::new()),
            next_key: TRef::new(0),
            shutdown: TRef::new(false),
            capacity,
            strategy,
        })
    }

    /// A bounded hub whose `publish` retries while any subscriber is full.
    pub fn bounded<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::BackPressure)
    }

    /// A bounded hub that drops messages while any subscriber is full.
    pub fn dropping<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::Dropping)
    }

    /// A bounded hub that evicts old messages from full subscribers.
    pub fn sliding<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::Sliding)
    }

    /// A hub without a capacity limit.
    pub fn unbounded<E: Data>() -> Stm<Self, E> {
        Self::make(None, Strategy::BackPressure)
    }

    /// Per-subscriber capacity, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn open_subscribers<E: Data>(&self) -> Stm<Vec<Subscriber<A>>, E> {
        let subscribers = self.subscribers.clone();
        self.shutdown.get().flat_map(move |shut| {
            if shut {
                Stm::interrupt()
            } else {
                subscribers.get()
            }
        })
    }

    /// Publish to every subscriber; `false` if the message was dropped.
    pub fn publish<E: Data>(&self, message: A) -> Stm<bool, E> {
        let hub = self.clone();
        Stm::new(move |journal| {
            let subscribers = tx_try!(hub.open_subscribers::<E>().run(journal));
            let mut buffers = Vec::with_capacity(subscribers.len());
            for subscriber in &subscribers {
                buffers.push(tx_try!(subscriber.buffer.get::<E>().run(journal)));
            }
            if let Some(cap) = hub.capacity {
                if buffers.iter().any(|b| b.len() >= cap) {
                    match hub.strategy {
                        Strategy::BackPressure => return Tx::Retry,
                        Strategy::Dropping => return Tx::Done(false),
                        Strategy::Sliding => buffers
                            .iter_mut()
                            .filter(|b| b.len() >= cap)
                            .for_each(|b| {
                                b.pop_front();
                            }),
                    }
                }
            }
            for (subscriber, mut buffer) in subscribers.iter().zip(buffers) {
                buffer.push_back(message.clone());
                tx_try!(subscriber.buffer.set::<E>(buffer).run(journal));
            }
            Tx::Done(true)
        })
    }

    /// Publish messages in order; `false` if any was dropped.
    pub fn publish_all<E: Data>(&self, messages: impl IntoIterator<Item = A>) -> Stm<bool, E> {
        let hub = self.clone();
        let messages: Vec<A> = messages.into_iter().collect();
        Stm::for_each(messages, move |message| hub.publish(message))
            .map(|accepted| accepted.into_iter().all(|a| a))
    }

    /// Subscribe inside a transaction. The caller must `unsubscribe`.
    pub fn subscribe<E: Data>(&self) -> Stm<TSubscription<A>, E> {
        let hub = self.clone();
        Stm::new(move |journal| {
            let mut subscribers = tx_try!(hub.open_subscribers::<E>().run(journal));
            let key = tx_try!(hub.next_key.get_and_update::<E>(|k| k + 1).run(journal));
            let buffer = TRef::new(VecDeque::new());
            subscribers.push(Subscriber {
                key,
                buffer: buffer.clone(),
            });
            tx_try!(hub.subscribers.set::<E>(subscribers).run(journal));
            Tx::Done(TSubscription {
                key,
                buffer,
                closed: TRef::new(false),
                hub: hub.clone(),
            })
        })
    }

    /// Subscribe for the lifetime of the current scope.
    pub fn subscribe_scoped<E: Data>(&self) -> Effect<TSubscription<A>, E> {
        scope::acquire_release(self.subscribe().commit(), |subscription: TSubscription<A>, _| {
            subscription.unsubscribe().commit()
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count<E: Data>(&self) -> Stm<usize, E> {
        self.subscribers.get().map(|s: Vec<Subscriber<A>>| s.len())
    }

    /// Shut the hub down; publishers and subscribers are interrupted.
    pub fn shutdown<E: Data>(&self) -> Stm<(), E> {
        self.shutdown
            .set(true)
            .zip_right(self.subscribers.set(Vec::new()))
    }

    /// Whether the hub has been shut down.
    pub fn is_shutdown<E: Data>(&self) -> Stm<bool, E> {
        self.shutdown.get()
    }
}

/// One subscriber's buffer on a [`THub`].
pub struct TSubscription<A> {
    key: u64,
    buffer: TRef<VecDeque<A>>,
    closed: TRef<bool>,
    hub: THub<A>,
}

impl<A> Clone for TSubscription<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            buffer: self.buffer.clone(),
            closed: self.closed.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<A> fmt::Debug for TSubscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TSubscription").field("key", &self.key).finish()
    }
}

impl<A: Data> TSubscription<A> {
    fn open_buffer<E: Data>(&self) -> Stm<VecDeque<A>, E> {
        let buffer = self.buffer.clone();
        self.closed
            .get()
            .zip(self.hub.shutdown.get())
            .flat_map(move |(closed, shut)| {
                if closed || shut {
                    Stm::interrupt()
                } else {
                    buffer.get()
                }
            })
    }

    /// Take the oldest message, retrying while none is buffered.
    pub fn take<E: Data>(&self) -> Stm<A, E> {
        let subscription = self.clone();
        Stm::new(move |journal| {
            let mut buffer = tx_try!(subscription.open_buffer::<E>().run(journal));
            match buffer.pop_front() {
                Some(message) => {
                    tx_try!(subscription.buffer.set::<E>(buffer).run(journal));
                    Tx::Done(message)
                }
                None => Tx::Retry,
            }
        })
    }

    /// Take up to `max` buffered messages without retrying.
    pub fn take_up_to<E: Data>(&self, max: usize) -> Stm<Vec<A>, E> {
        let subscription = self.clone();
        Stm::new(move |journal| {
            let mut buffer = tx_try!(subscription.open_buffer::<E>().run(journal));
            let n = max.min(buffer.len());
            let taken: Vec<A> = buffer.drain(..n).collect();
            if !taken.is_empty() {
                tx_try!(subscription.buffer.set::<E>(buffer).run(journal));
            }
            Tx::Done(taken)
        })
    }

    /// Take every buffered message.
    pub fn take_all<E: Data>(&self) -> Stm<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    /// Take the oldest message if there is one.
    pub fn poll<E: Data>(&self) -> Stm<Option<A>, E> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    /// Number of buffered messages.
    pub fn size<E: Data>(&self) -> Stm<usize, E> {
        self.open_buffer().map(|b: VecDeque<A>| b.len())
    }

    /// Leave the hub. Later takes are interrupted.
    pub fn unsubscribe<E: Data>(&self) -> Stm<(), E> {
        let key = self.key;
        self.closed.set(true).zip_right(
            self.hub
                .subscribers
                .update(move |subs: Vec<Subscriber<A>>| subs.into_iter().filter(|s| s.key != key).collect()),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::scope::scoped;
    use std::convert::Infallible;
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let rt = rt();
        let tx: Stm<(Vec<i32>, Vec<i32>)> = THub::unbounded().flat_map(|hub: THub<i32>| {
            let h = hub.clone();
            hub.subscribe()
                .zip(hub.subscribe())
                .flat_map(move |(a, b): (TSubscription<i32>, TSubscription<i32>)| {
                    h.publish_all(vec![1, 2]).zip_right(a.take_all().zip(b.take_all()))
                })
        });
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (vec![1, 2], vec![1, 2]));
    }

    #[test]
    fn test_dropping_is_all_or_nothing() {
        let rt = rt();
        let tx: Stm<(bool, Vec<i32>, Vec<i32>)> = THub::dropping(1).flat_map(|hub: THub<i32>| {
            let h = hub.clone();
            hub.subscribe().flat_map(move |a: TSubscription<i32>| {
                let h2 = h.clone();
                h.publish(1).zip_right(h.subscribe()).flat_map(move |b: TSubscription<i32>| {
                    h2.publish(2)
                        .zip(a.take_all())
                        .zip(b.take_all())
                        .map(|((ok, a), b)| (ok, a, b))
                })
            })
        });
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (false, vec![1], vec![]));
    }

    #[test]
    fn test_sliding_evicts_only_full_subscribers() {
        let rt = rt();
        let hub: THub<i32> = rt.run_sync(THub::sliding::<Infallible>(2).commit()).unwrap();
        let a = rt.run_sync(hub.subscribe::<Infallible>().commit()).unwrap();
        rt.run_sync(hub.publish_all::<Infallible>(vec![1, 2]).commit()).unwrap();
        let b = rt.run_sync(hub.subscribe::<Infallible>().commit()).unwrap();
        rt.run_sync(hub.publish::<Infallible>(3).commit()).unwrap();
        let tx: Stm<(Vec<i32>, Vec<i32>)> = a.take_all().zip(b.take_all());
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (vec![2, 3], vec![3]));
    }

    #[test]
    fn test_back_pressure_publish_waits() {
        let rt = rt();
        let hub: THub<i32> = rt.run_sync(THub::bounded::<Infallible>(1).commit()).unwrap();
        let sub = rt.run_sync(hub.subscribe::<Infallible>().commit()).unwrap();
        rt.run_sync(hub.publish::<Infallible>(1).commit()).unwrap();
        let publisher = rt.run_fork(hub.publish::<Infallible>(2).commit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(publisher.unsafe_poll().is_none());
        assert_eq!(rt.run_sync(sub.take::<Infallible>().commit()).unwrap(), 1);
        assert!(rt.run_promise(publisher.join()).wait().unwrap());
        assert_eq!(rt.run_sync(sub.poll::<Infallible>().commit()).unwrap(), Some(2));
    }

    #[test]
    fn test_scoped_subscription_is_removed() {
        let rt = rt();
        let hub: THub<i32> = rt.run_sync(THub::unbounded::<Infallible>().commit()).unwrap();
        let h = hub.clone();
        let inside: Effect<usize> = scoped(
            hub.subscribe_scoped()
                .flat_map(move |_sub| h.subscriber_count().commit()),
        );
        assert_eq!(rt.run_sync(inside).unwrap(), 1);
        assert_eq!(
            rt.run_sync(hub.subscriber_count::<Infallible>().commit()).unwrap(),
            0
        );
    }

    #[test]
    fn test_shutdown_interrupts_takers() {
        let rt = rt();
        let hub: THub<i32> = rt.run_sync(THub::unbounded::<Infallible>().commit()).unwrap();
        let sub = rt.run_sync(hub.subscribe::<Infallible>().commit()).unwrap();
        let taker = rt.run_fork(sub.take::<Infallible>().commit());
        std::thread::sleep(Duration::from_millis(20));
        rt.run_sync(hub.shutdown::<Infallible>().commit()).unwrap();
        let exit = rt.run_promise(taker.await_exit::<Infallible>()).wait().unwrap();
        assert!(exit.is_interrupted());
    }
}
