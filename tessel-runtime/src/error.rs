//! Errors surfaced at the edge of the runtime.

use std::error::Error;
use std::fmt;

use crate::cause::{Cause, Squashed};

/// The failure of an effect run through a blocking or promise entry point.
///
/// Carries the full [`Cause`]; `Display` shows the representative reason
/// picked by [`Cause::squash`].
#[derive(Clone, PartialEq)]
pub struct FiberFailure<E> {
    cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    pub(crate) fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// The full cause tree.
    pub fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Take the cause tree.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }

    /// The representative failure reason.
    pub fn squash(self) -> Squashed<E> {
        self.cause.squash()
    }

    /// The first typed failure, if any.
    pub fn failure(&self) -> Option<&E> {
        self.cause.failures().into_iter().next()
    }

    /// Whether the run was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.cause.is_interrupted()
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure")
            .field("cause", &self.cause)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = self.failure() {
            return write!(f, "fiber failed: {:?}", error);
        }
        if let Some(defect) = self.cause.defects().first() {
            return write!(f, "fiber died: {}", defect);
        }
        if self.cause.is_interrupted() {
            let mut ids: Vec<String> = self
                .cause
                .interruptors()
                .iter()
                .map(|id| id.to_string())
                .collect();
            ids.sort();
            return write!(f, "fiber interrupted by [{}]", ids.join(", "));
        }
        write!(f, "fiber failed with an empty cause")
    }
}

impl<E: fmt::Debug> Error for FiberFailure<E> {}

// ============================================================================
// Tests
// ============================================================================
