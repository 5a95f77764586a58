//! Terminal outcome of a fiber or effect run.

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// The terminal outcome of a computation: a value or a [`Cause`].
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// Completed with a value.
    Success(A),
    /// Failed with a cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    /// A failure with the given cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption by `fiber_id`.
    pub fn interrupt(fiber_id: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(fiber_id))
    }

    /// True on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True on failure of any kind.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True if the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform every typed failure.
    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Convert into a `Result` carrying the whole cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// Forget the value and the typed error payloads, keeping the shape.
    ///
    /// This is what finalizers observe.
    pub fn as_unit(&self) -> Exit<(), ()> {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(cause) => Exit::Failure(erase(cause)),
        }
    }
}

fn erase<E>(cause: &Cause<E>) -> Cause<()> {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(_) => Cause::Fail(()),
        Cause::Die(d) => Cause::Die(d.clone()),
        Cause::Interrupt(id) => Cause::Interrupt(id.clone()),
        Cause::Sequential(l, r) => Cause::Sequential(Box::new(erase(l)), Box::new(erase(r))),
        Cause::Parallel(l, r) => Cause::Parallel(Box::new(erase(l)), Box::new(erase(r))),
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projections() {
        let ok: Exit<i32, String> = Exit::succeed(1);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&1));
        assert!(ok.cause().is_none());

        let err: Exit<i32, String> = Exit::fail("bad".into());
        assert!(err.is_failure());
        assert!(!err.is_interrupted());
        assert_eq!(err.into_result(), Err(Cause::Fail("bad".to_string())));
    }

    #[test]
    fn test_as_unit_keeps_shape() {
        let exit: Exit<i32, &str> = Exit::fail_cause(Cause::fail("e").then(Cause::die("d")));
        let unit = exit.as_unit();
        let cause = unit.cause().cloned().unwrap_or_default();
        assert_eq!(cause.failures().len(), 1);
        assert_eq!(cause.defects().len(), 1);
    }

    #[test]
    fn test_interrupt_exit() {
        let exit: Exit<(), ()> = Exit::interrupt(FiberId::None);
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_from_result() {
        let exit: Exit<u8, u8> = Ok(3).into();
        assert_eq!(exit.map(|n| n + 1), Exit::Success(4));
    }
}
