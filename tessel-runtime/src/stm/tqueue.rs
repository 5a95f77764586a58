//! Transactional queues.

use std::collections::VecDeque;
use std::fmt;

use super::{Stm, TRef, Tx};
use crate::queue::Strategy;
use crate::value::Data;

/// A FIFO queue whose operations compose inside transactions.
///
/// Waiting is expressed with `retry`: `take` on an empty queue and `offer`
/// on a full back-pressured queue re-run once another transaction changes
/// the queue.
pub struct TQueue<A> {
    items: TRef<VecDeque<A>>,
    shutdown: TRef<bool>,
    capacity: Option<usize>,
    strategy: Strategy,
}

impl<A> Clone for TQueue<A> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            shutdown: self.shutdown.clone(),
            capacity: self.capacity,
            strategy: self.strategy,
        }
    }
}

impl<A> fmt::Debug for TQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TQueue")
            .field("capacity", &self.capacity)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<A: Data> TQueue<A> {
    fn make<E: Data>(capacity: Option<usize>, strategy: Strategy) -> Stm<Self, E> {
        if capacity == Some(0) {
            return Stm::die("queue capacity must be positive");
        }
        Stm::sync(move || Self {
            items: TRef::new(VecDeque::new()),
            shutdown: TRef::new(false),
            capacity,
            strategy,
        })
    }

    /// A bounded queue whose `offer` retries while full.
    pub fn bounded<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::BackPressure)
    }

    /// A bounded queue that drops new elements while full.
    pub fn dropping<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::Dropping)
    }

    /// A bounded queue that evicts the oldest element while full.
    pub fn sliding<E: Data>(capacity: usize) -> Stm<Self, E> {
        Self::make(Some(capacity), Strategy::Sliding)
    }

    /// A queue without a capacity limit.
    pub fn unbounded<E: Data>() -> Stm<Self, E> {
        Self::make(None, Strategy::BackPressure)
    }

    /// The capacity, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Read the items, interrupting if the queue is shut down.
    fn open_items<E: Data>(&self) -> Stm<VecDeque<A>, E> {
        let items = self.items.clone();
        self.shutdown.get().flat_map(move |shut| {
            if shut {
                Stm::interrupt()
            } else {
                items.get()
            }
        })
    }

    /// Offer one element; `false` if it was dropped.
    pub fn offer<E: Data>(&self, value: A) -> Stm<bool, E> {
        let queue = self.clone();
        Stm::new(move |journal| {
            let mut items = tx_try!(queue.open_items::<E>().run(journal));
            let full = queue.capacity.is_some_and(|cap| items.len() >= cap);
            if full {
                match queue.strategy {
                    Strategy::BackPressure => return Tx::Retry,
                    Strategy::Dropping => return Tx::Done(false),
                    Strategy::Sliding => {
                        items.pop_front();
                    }
                }
            }
            items.push_back(value.clone());
            tx_try!(queue.items.set::<E>(items).run(journal));
            Tx::Done(true)
        })
    }

    /// Offer elements in order; `false` if any was dropped.
    pub fn offer_all<E: Data>(&self, values: impl IntoIterator<Item = A>) -> Stm<bool, E> {
        let queue = self.clone();
        let values: Vec<A> = values.into_iter().collect();
        Stm::for_each(values, move |value| queue.offer(value))
            .map(|accepted| accepted.into_iter().all(|a| a))
    }

    /// Take the oldest element, retrying while empty.
    pub fn take<E: Data>(&self) -> Stm<A, E> {
        let queue = self.clone();
        Stm::new(move |journal| {
            let mut items = tx_try!(queue.open_items::<E>().run(journal));
            match items.pop_front() {
                Some(value) => {
                    tx_try!(queue.items.set::<E>(items).run(journal));
                    Tx::Done(value)
                }
                None => Tx::Retry,
            }
        })
    }

    /// Take up to `max` elements without retrying.
    pub fn take_up_to<E: Data>(&self, max: usize) -> Stm<Vec<A>, E> {
        let queue = self.clone();
        Stm::new(move |journal| {
            let mut items = tx_try!(queue.open_items::<E>().run(journal));
            let n = max.min(items.len());
            let taken: Vec<A> = items.drain(..n).collect();
            if !taken.is_empty() {
                tx_try!(queue.items.set::<E>(items).run(journal));
            }
            Tx::Done(taken)
        })
    }

    /// Take everything currently queued.
    pub fn take_all<E: Data>(&self) -> Stm<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    /// The oldest element without removing it, retrying while empty.
    pub fn peek<E: Data>(&self) -> Stm<A, E> {
        self.open_items().flat_map(|items: VecDeque<A>| match items.front() {
            Some(value) => Stm::succeed(value.clone()),
            None => Stm::retry(),
        })
    }

    /// Take the oldest element if there is one.
    pub fn poll<E: Data>(&self) -> Stm<Option<A>, E> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    /// Number of queued elements.
    pub fn size<E: Data>(&self) -> Stm<usize, E> {
        self.open_items().map(|items: VecDeque<A>| items.len())
    }

    /// Whether the queue is empty.
    pub fn is_empty<E: Data>(&self) -> Stm<bool, E> {
        self.size().map(|n| n == 0)
    }

    /// Whether the queue is at capacity. Always `false` if unbounded.
    pub fn is_full<E: Data>(&self) -> Stm<bool, E> {
        let capacity = self.capacity;
        self.size()
            .map(move |n| capacity.is_some_and(|cap| n >= cap))
    }

    /// Shut the queue down. Pending and later operations are interrupted.
    pub fn shutdown<E: Data>(&self) -> Stm<(), E> {
        self.shutdown
            .set(true)
            .zip_right(self.items.set(VecDeque::new()))
    }

    /// Whether the queue has been shut down.
    pub fn is_shutdown<E: Data>(&self) -> Stm<bool, E> {
        self.shutdown.get()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::runtime::Runtime;
    use std::convert::Infallible;
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_fifo_and_peek() {
        let rt = rt();
        let tx: Stm<(i32, Vec<i32>, Option<i32>)> = TQueue::unbounded().flat_map(|q: TQueue<i32>| {
            q.offer_all(vec![1, 2, 3])
                .zip_right(q.peek())
                .zip(q.take_all())
                .zip(q.poll())
                .map(|((p, all), polled)| (p, all, polled))
        });
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (1, vec![1, 2, 3], None));
    }

    #[test]
    fn test_dropping_and_sliding() {
        let rt = rt();
        let dropping: Stm<(bool, Vec<i32>)> = TQueue::dropping(2).flat_map(|q: TQueue<i32>| {
            q.offer_all(vec![1, 2, 3]).zip(q.take_all())
        });
        assert_eq!(rt.run_sync(dropping.commit()).unwrap(), (false, vec![1, 2]));
        let sliding: Stm<(bool, Vec<i32>)> = TQueue::sliding(2).flat_map(|q: TQueue<i32>| {
            q.offer_all(vec![1, 2, 3]).zip(q.take_all())
        });
        assert_eq!(rt.run_sync(sliding.commit()).unwrap(), (true, vec![2, 3]));
    }

    #[test]
    fn test_take_waits_for_offer() {
        let rt = rt();
        let q: TQueue<i32> = rt.run_sync(TQueue::unbounded::<Infallible>().commit()).unwrap();
        let taker = rt.run_fork(q.take::<Infallible>().commit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(taker.unsafe_poll().is_none());
        rt.run_sync(q.offer::<Infallible>(5).commit()).unwrap();
        assert_eq!(rt.run_promise(taker.join()).wait().unwrap(), 5);
    }

    #[test]
    fn test_back_pressure_offer_waits() {
        let rt = rt();
        let q: TQueue<i32> = rt.run_sync(TQueue::bounded::<Infallible>(1).commit()).unwrap();
        rt.run_sync(q.offer::<Infallible>(1).commit()).unwrap();
        let offer = rt.run_fork(q.offer::<Infallible>(2).commit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(offer.unsafe_poll().is_none());
        let taken: Effect<(i32, bool)> = q.take().commit().zip(offer.join());
        assert_eq!(rt.run_promise(taken).wait().unwrap(), (1, true));
        assert!(rt.run_sync(q.is_full::<Infallible>().commit()).unwrap());
    }

    #[test]
    fn test_shutdown_interrupts() {
        let rt = rt();
        let q: TQueue<i32> = rt.run_sync(TQueue::unbounded::<Infallible>().commit()).unwrap();
        let taker = rt.run_fork(q.take::<Infallible>().commit());
        std::thread::sleep(Duration::from_millis(20));
        rt.run_sync(q.shutdown::<Infallible>().commit()).unwrap();
        let exit = rt.run_promise(taker.await_exit::<Infallible>()).wait().unwrap();
        assert!(exit.is_interrupted());
        assert!(rt.run_sync(q.is_shutdown::<Infallible>().commit()).unwrap());
    }

    #[test]
    fn test_zero_capacity_dies() {
        let rt = rt();
        let exit = rt.run_sync_exit(TQueue::<i32>::bounded::<Infallible>(0).commit());
        assert!(exit.cause().is_some_and(|c| c.is_die()));
    }
}
