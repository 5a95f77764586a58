//! # Failure Causes
//!
//! A [`Cause`] is a tree describing every reason a computation failed:
//! typed failures, defects, and interruptions, composed sequentially (one
//! after another, e.g. a finalizer failing while an error propagates) or in
//! parallel (concurrent fibers failing together). Nothing is dropped.
//!
//! `Empty` is the identity of both `then` and `both`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::Cause;
//!
//! let cause = Cause::fail("boom").then(Cause::die("finalizer crashed"));
//! assert_eq!(cause.failures(), vec![&"boom"]);
//! assert_eq!(cause.defects().len(), 1);
//! ```

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::fiber::FiberId;

/// An unexpected, unrecoverable error.
///
/// Defects come from panics inside user code, explicit `Effect::die`, and
/// runtime invariant violations. They bypass typed error handlers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect from anything printable.
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: Arc::from(message.to_string()),
        }
    }

    /// Build a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(format_args!("panic: {}", message))
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// The full story of why a computation failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// An interruption by `fiber_id`.
    pub fn interrupt(fiber_id: FiberId) -> Self {
        Cause::Interrupt(fiber_id)
    }

    /// Sequential composition; `Empty` on either side is elided.
    pub fn then(self, other: Cause<E>) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Cause::Sequential(Box::new(self), Box::new(other)),
        }
    }

    /// Parallel composition; `Empty` on either side is elided.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Cause::Parallel(Box::new(self), Box::new(other)),
        }
    }

    /// True if the tree contains no failure at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => false,
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => l.is_empty() && r.is_empty(),
        }
    }

    /// True if the tree contains at least one typed failure.
    pub fn is_failure(&self) -> bool {
        self.find(&mut |c| matches!(c, Cause::Fail(_)))
    }

    /// True if the tree contains at least one defect.
    pub fn is_die(&self) -> bool {
        self.find(&mut |c| matches!(c, Cause::Die(_)))
    }

    /// True if the tree contains at least one interruption.
    pub fn is_interrupted(&self) -> bool {
        self.find(&mut |c| matches!(c, Cause::Interrupt(_)))
    }

    /// True if every leaf is an interruption.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && !self.is_failure() && !self.is_die()
    }

    fn find(&self, pred: &mut dyn FnMut(&Cause<E>) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => l.find(pred) || r.find(pred),
            _ => false,
        }
    }

    /// Typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    /// Defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// Every fiber that requested an interruption recorded in this cause.
    pub fn interruptors(&self) -> HashSet<FiberId> {
        let mut out = HashSet::new();
        self.walk(&mut |c| {
            if let Cause::Interrupt(id) = c {
                out.insert(id.clone());
            }
        });
        out
    }

    fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Cause<E>)) {
        visit(self);
        if let Cause::Sequential(l, r) | Cause::Parallel(l, r) = self {
            l.walk(visit);
            r.walk(visit);
        }
    }

    /// Transform every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2>(self, f: &mut dyn FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(l, r) => {
                let l = l.map_inner(f);
                Cause::Sequential(Box::new(l), Box::new(r.map_inner(f)))
            }
            Cause::Parallel(l, r) => {
                let l = l.map_inner(f);
                Cause::Parallel(Box::new(l), Box::new(r.map_inner(f)))
            }
        }
    }

    /// Turn every typed failure into a defect rendered by `f`.
    pub fn fail_to_die(self, mut f: impl FnMut(E) -> Defect) -> Cause<E> {
        self.flat_map_leaves(&mut |c| match c {
            Cause::Fail(e) => Cause::Die(f(e)),
            other => other,
        })
    }

    /// Remove every typed failure, keeping defects and interruptions.
    pub fn strip_failures(self) -> Cause<E> {
        self.flat_map_leaves(&mut |c| match c {
            Cause::Fail(_) => Cause::Empty,
            other => other,
        })
    }

    fn flat_map_leaves(self, f: &mut dyn FnMut(Cause<E>) -> Cause<E>) -> Cause<E> {
        match self {
            Cause::Sequential(l, r) => {
                let l = l.flat_map_leaves(f);
                l.then(r.flat_map_leaves(f))
            }
            Cause::Parallel(l, r) => {
                let l = l.flat_map_leaves(f);
                l.both(r.flat_map_leaves(f))
            }
            leaf => f(leaf),
        }
    }

    /// The first typed failure, or the remaining cause if there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if self.is_failure() {
            let mut first = None;
            self.into_first_failure(&mut first);
            if let Some(e) = first {
                return Ok(e);
            }
            return Err(Cause::Empty);
        }
        Err(self)
    }

    fn into_first_failure(self, slot: &mut Option<E>) {
        if slot.is_some() {
            return;
        }
        match self {
            Cause::Fail(e) => *slot = Some(e),
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                l.into_first_failure(slot);
                r.into_first_failure(slot);
            }
            _ => {}
        }
    }

    /// Collapse the tree to one representative reason.
    ///
    /// Prefers the first typed failure, then the first defect, then an
    /// interruption.
    pub fn squash(self) -> Squashed<E> {
        let defect = self.defects().first().map(|d| (*d).clone());
        let interruptors = self.interruptors();
        match self.failure_or_cause() {
            Ok(e) => Squashed::Fail(e),
            Err(_) => match defect {
                Some(d) => Squashed::Die(d),
                None if !interruptors.is_empty() => Squashed::Interrupted(interruptors),
                None => Squashed::Empty,
            },
        }
    }

    /// Number of leaves (including `Empty` leaves) in the tree.
    pub fn size(&self) -> usize {
        let mut n = 0;
        self.walk(&mut |c| {
            if !matches!(c, Cause::Sequential(..) | Cause::Parallel(..)) {
                n += 1;
            }
        });
        n
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Render the tree for humans.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            Cause::Empty => out.push_str(&format!("{}Empty\n", pad)),
            Cause::Fail(e) => out.push_str(&format!("{}Fail({:?})\n", pad, e)),
            Cause::Die(d) => out.push_str(&format!("{}Die({})\n", pad, d)),
            Cause::Interrupt(id) => out.push_str(&format!("{}Interrupted by {}\n", pad, id)),
            Cause::Sequential(l, r) => {
                out.push_str(&format!("{}Sequential\n", pad));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
            Cause::Parallel(l, r) => {
                out.push_str(&format!("{}Parallel\n", pad));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
        }
    }
}

/// A single representative failure reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Squashed<E> {
    /// A typed failure.
    Fail(E),
    /// A defect.
    Die(Defect),
    /// Interrupted by these fibers.
    Interrupted(HashSet<FiberId>),
    /// No failure.
    Empty,
}

// ============================================================================
// Tests
// ============================================================================
