//! Transactional references.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::journal::RefSlot;
use super::{Stm, Tx};
use crate::value::{Data, Value};

/// A mutable cell that is only read and written inside a transaction.
pub struct TRef<A> {
    slot: Arc<RefSlot>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TRef").field(&self.slot.id()).finish()
    }
}

impl<A> PartialEq for TRef<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<A> Eq for TRef<A> {}

impl<A: Data> TRef<A> {
    /// Create a ref outside any transaction.
    pub fn new(value: A) -> Self {
        Self {
            slot: RefSlot::new(Value::new(value)),
            _marker: PhantomData,
        }
    }

    /// Create a ref inside a transaction.
    pub fn make<E: Data>(value: A) -> Stm<Self, E> {
        Stm::sync(move || Self::new(value.clone()))
    }

    /// Number of fibers parked on this ref by `retry`.
    pub fn waiter_count(&self) -> usize {
        self.slot.waiter_count()
    }

    /// Read the current value.
    pub fn get<E: Data>(&self) -> Stm<A, E> {
        let slot = self.slot.clone();
        Stm::new(move |journal| match journal.read(&slot) {
            Ok(value) => Tx::Done(value.downcast::<A>()),
            Err(_) => Tx::Inconsistent,
        })
    }

    /// Replace the value.
    pub fn set<E: Data>(&self, value: A) -> Stm<(), E> {
        let slot = self.slot.clone();
        Stm::new(move |journal| match journal.write(&slot, Value::new(value.clone())) {
            Ok(()) => Tx::Done(()),
            Err(_) => Tx::Inconsistent,
        })
    }

    /// Compute a result and a new value from the current one.
    pub fn modify<B: Data, E: Data>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Stm<B, E> {
        let slot = self.slot.clone();
        Stm::new(move |journal| {
            let current = match journal.read(&slot) {
                Ok(value) => value.downcast::<A>(),
                Err(_) => return Tx::Inconsistent,
            };
            let (out, next) = f(current);
            match journal.write(&slot, Value::new(next)) {
                Ok(()) => Tx::Done(out),
                Err(_) => Tx::Inconsistent,
            }
        })
    }

    /// Apply `f` to the value.
    pub fn update<E: Data>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` and return the new value.
    pub fn update_and_get<E: Data>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<A, E> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Apply `f` and return the old value.
    pub fn get_and_update<E: Data>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<A, E> {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Replace the value and return the old one.
    pub fn get_and_set<E: Data>(&self, value: A) -> Stm<A, E> {
        self.modify(move |a| (a, value.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::convert::Infallible;

    #[test]
    fn test_ref_operations() {
        let rt = Runtime::builder().num_workers(1).build().unwrap();
        let r = TRef::new(10);
        let tx: Stm<(i32, i32, i32, String)> = r
            .get_and_update(|n| n + 1)
            .zip(r.update_and_get(|n| n * 2))
            .zip(r.get_and_set(0))
            .zip(r.modify(|n| (format!("was {}", n), n - 1)))
            .map(|(((a, b), c), d)| (a, b, c, d));
        assert_eq!(
            rt.run_sync(tx.commit()).unwrap(),
            (10, 22, 22, "was 0".to_string())
        );
        assert_eq!(rt.run_sync(r.get::<Infallible>().commit()).unwrap(), -1);
    }

    #[test]
    fn test_make_inside_transaction() {
        let rt = Runtime::builder().num_workers(1).build().unwrap();
        let tx: Stm<String> = TRef::make("fresh".to_string()).flat_map(|r: TRef<String>| r.get());
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), "fresh");
    }

    #[test]
    fn test_identity_equality() {
        let a = TRef::new(1);
        let b = TRef::new(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
