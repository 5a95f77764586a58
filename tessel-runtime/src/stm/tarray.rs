//! Fixed-size transactional arrays.

use std::fmt;
use std::sync::Arc;

use super::{Stm, TRef, Tx};
use crate::value::Data;

/// A fixed-length array of [`TRef`]s.
///
/// Each element is its own ref, so transactions touching different indices
/// do not conflict.
pub struct TArray<A> {
    refs: Arc<[TRef<A>]>,
}

impl<A> Clone for TArray<A> {
    fn clone(&self) -> Self {
        Self {
            refs: self.refs.clone(),
        }
    }
}

impl<A> fmt::Debug for TArray<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TArray").field("len", &self.refs.len()).finish()
    }
}

impl<A: Data> TArray<A> {
    /// Create an array outside any transaction.
    pub fn from_vec(values: Vec<A>) -> Self {
        Self {
            refs: values.into_iter().map(TRef::new).collect(),
        }
    }

    /// Create an array inside a transaction.
    pub fn make<E: Data>(values: Vec<A>) -> Stm<Self, E> {
        Stm::sync(move || Self::from_vec(values.clone()))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    fn at<B: Data, E: Data>(&self, index: usize, f: impl FnOnce(&TRef<A>) -> Stm<B, E>) -> Stm<B, E> {
        match self.refs.get(index) {
            Some(r) => f(r),
            None => Stm::die(format!(
                "index {} out of bounds for array of length {}",
                index,
                self.refs.len()
            )),
        }
    }

    /// Read one element. Dies if `index` is out of bounds.
    pub fn get<E: Data>(&self, index: usize) -> Stm<A, E> {
        self.at(index, |r| r.get())
    }

    /// Write one element. Dies if `index` is out of bounds.
    pub fn set<E: Data>(&self, index: usize, value: A) -> Stm<(), E> {
        self.at(index, move |r| r.set(value))
    }

    /// Apply `f` to one element. Dies if `index` is out of bounds.
    pub fn update<E: Data>(&self, index: usize, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), E> {
        self.at(index, move |r| r.update(f))
    }

    /// Read every element in order.
    pub fn to_vec<E: Data>(&self) -> Stm<Vec<A>, E> {
        Stm::for_each(self.refs.to_vec(), |r: TRef<A>| r.get())
    }

    /// Fold over the elements in order.
    pub fn fold<S: Data, E: Data>(&self, zero: S, f: impl Fn(S, A) -> S + Send + Sync + 'static) -> Stm<S, E> {
        self.to_vec()
            .map(move |values| values.into_iter().fold(zero.clone(), &f))
    }

    /// Count elements matching `p`.
    pub fn count<E: Data>(&self, p: impl Fn(&A) -> bool + Send + Sync + 'static) -> Stm<usize, E> {
        self.fold(0, move |n, a| if p(&a) { n + 1 } else { n })
    }

    /// Whether any element matches `p`. Stops reading at the first match.
    pub fn exists<E: Data>(&self, p: impl Fn(&A) -> bool + Send + Sync + 'static) -> Stm<bool, E> {
        self.find_index(p).map(|found| found.is_some())
    }

    /// Index of the first element matching `p`.
    pub fn find_index<E: Data>(
        &self,
        p: impl Fn(&A) -> bool + Send + Sync + 'static,
    ) -> Stm<Option<usize>, E> {
        let refs = self.refs.clone();
        Stm::new(move |journal| {
            for (index, r) in refs.iter().enumerate() {
                match r.get::<E>().run(journal).split() {
                    Ok(value) if p(&value) => return Tx::Done(Some(index)),
                    Ok(_) => {}
                    Err(other) => return other,
                }
            }
            Tx::Done(None)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
