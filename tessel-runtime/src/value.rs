//! # Erased Values
//!
//! The interpreter threads values of many different types through a single
//! continuation stack. Each value is boxed behind [`Value`], a cloneable
//! type-erased payload, and recovered with a checked downcast at the typed
//! edges (`Effect<A, E>`, `Fiber<A, E>`, `Stm<A, E>`).
//!
//! ## Design
//!
//! - Every payload satisfies [`Data`]: `Clone + Send + Sync + 'static`
//! - `Clone` lets an effect description be run any number of times
//! - A failed downcast is an internal invariant violation; it panics and the
//!   interpreter turns the panic into a `Die`

use std::any::{self, Any};
use std::fmt;

/// Bound required of every value, error and state type flowing through the runtime.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Object-safe view of a [`Data`] value.
trait AnyData: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn AnyData>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
}

impl<T: Data> AnyData for T {
    fn clone_boxed(&self) -> Box<dyn AnyData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        any::type_name::<T>()
    }
}

/// A type-erased, cloneable payload.
pub(crate) struct Value(Box<dyn AnyData>);

impl Value {
    /// Erase a typed value.
    pub(crate) fn new<T: Data>(value: T) -> Self {
        Value(Box::new(value))
    }

    /// The unit value.
    pub(crate) fn unit() -> Self {
        Value::new(())
    }

    /// Recover the typed value.
    ///
    /// Panics on a type mismatch; callers only downcast values they erased.
    pub(crate) fn downcast<T: Data>(self) -> T {
        let found = (*self.0).type_name();
        match self.0.into_any().downcast::<T>() {
            Ok(boxed) => *boxed,
            Err(_) => panic!(
                "value type mismatch: expected {}, found {}",
                any::type_name::<T>(),
                found
            ),
        }
    }

    /// Borrow the typed value, if it has type `T`.
    pub(crate) fn downcast_ref<T: Data>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    /// Name of the erased type, for diagnostics.
    pub(crate) fn type_name(&self) -> &'static str {
        (*self.0).type_name()
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        Value((*self.0).clone_boxed())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.type_name())
    }
}

// ============================================================================
// Tests
// ============================================================================
