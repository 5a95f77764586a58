//! Fiber References
//!
//! A [`FiberRef<A>`] is a variable with one value per fiber, similar to
//! thread-local storage but scoped to fibers and aware of the fiber tree:
//!
//! - On fork, the child receives `fork(parent_value)`
//! - On join, the parent's value becomes `join(parent_value, child_value)`
//!   for every ref the child changed
//!
//! Log levels, log annotations, spans and the current scope are all carried
//! this way.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessel_runtime::{Effect, FiberRef};
//!
//! let request_id = FiberRef::new(String::from("none"));
//! let program: Effect<String> = request_id
//!     .locally("req-12345".to_string(), request_id.get());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::{Effect, Op};
use crate::value::{Data, Value};

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

type ForkFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type JoinFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Erased definition shared by every handle to one fiber ref.
pub(crate) struct FiberRefDef {
    id: u64,
    initial: Value,
    fork: ForkFn,
    join: JoinFn,
}

#[derive(Clone)]
pub(crate) struct RefEntry {
    def: Arc<FiberRefDef>,
    value: Value,
    version: u64,
}

/// The fiber-ref values of one fiber.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    entries: HashMap<u64, RefEntry>,
}

impl FiberRefs {
    pub(crate) fn get(&self, def: &Arc<FiberRefDef>) -> Value {
        match self.entries.get(&def.id) {
            Some(entry) => entry.value.clone(),
            None => def.initial.clone(),
        }
    }

    pub(crate) fn set(&mut self, def: &Arc<FiberRefDef>, value: Value) {
        let version = NEXT_VERSION.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            def.id,
            RefEntry {
                def: def.clone(),
                value,
                version,
            },
        );
    }

    /// Raw entry, for save and restore around a scoped override.
    pub(crate) fn entry(&self, def: &Arc<FiberRefDef>) -> Option<RefEntry> {
        self.entries.get(&def.id).cloned()
    }

    pub(crate) fn restore(&mut self, def: &Arc<FiberRefDef>, entry: Option<RefEntry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(def.id, entry);
            }
            None => {
                self.entries.remove(&def.id);
            }
        }
    }

    /// Values for a freshly forked child.
    pub(crate) fn fork_all(&self) -> FiberRefs {
        let entries = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let value = (entry.def.fork)(&entry.value);
                (
                    *id,
                    RefEntry {
                        def: entry.def.clone(),
                        value,
                        version: entry.version,
                    },
                )
            })
            .collect();
        FiberRefs { entries }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefs")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// The changes a fiber made to its refs since it started.
#[derive(Clone, Default)]
pub(crate) struct FiberRefsPatch {
    updates: Vec<(Arc<FiberRefDef>, Value)>,
}

impl FiberRefsPatch {
    /// Refs whose version in `current` differs from `initial`.
    pub(crate) fn diff(initial: &FiberRefs, current: &FiberRefs) -> FiberRefsPatch {
        let updates = current
            .entries
            .iter()
            .filter(|(id, entry)| {
                initial.entries.get(*id).map(|e| e.version) != Some(entry.version)
            })
            .map(|(_, entry)| (entry.def.clone(), entry.value.clone()))
            .collect();
        FiberRefsPatch { updates }
    }

    /// Merge the child's values into `refs` with each ref's join.
    pub(crate) fn apply(&self, refs: &mut FiberRefs) {
        for (def, child) in &self.updates {
            let parent = refs.get(def);
            let joined = (def.join)(&parent, child);
            refs.set(def, joined);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// A fiber-scoped variable.
pub struct FiberRef<A> {
    def: Arc<FiberRefDef>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({})", self.def.id)
    }
}

impl<A: Data> FiberRef<A> {
    /// A ref whose children start with a copy and whose joins keep the
    /// child's value.
    pub fn new(initial: A) -> Self {
        Self::new_with(initial, |a| a.clone(), |_, child| child.clone())
    }

    /// A ref with custom fork and join behavior.
    pub fn new_with(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> Self {
        let fork: ForkFn = Arc::new(move |v: &Value| {
            let a = v.downcast_ref::<A>().cloned().map(|a| fork(&a));
            a.map_or_else(|| v.clone(), Value::new)
        });
        let join: JoinFn = Arc::new(move |parent: &Value, child: &Value| {
            match (parent.downcast_ref::<A>(), child.downcast_ref::<A>()) {
                (Some(p), Some(c)) => Value::new(join(p, c)),
                _ => child.clone(),
            }
        });
        Self {
            def: Arc::new(FiberRefDef {
                id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
                initial: Value::new(initial),
                fork,
                join,
            }),
            _marker: PhantomData,
        }
    }

    /// Create a ref inside an effect.
    pub fn make<E: Data>(initial: A) -> Effect<FiberRef<A>, E> {
        Effect::sync(move || FiberRef::new(initial.clone()))
    }

    pub(crate) fn def(&self) -> &Arc<FiberRefDef> {
        &self.def
    }

    /// The value every fiber sees before setting one.
    pub fn initial(&self) -> A {
        self.def.initial.clone().downcast::<A>()
    }

    /// Read the current fiber's value.
    pub fn get<E: Data>(&self) -> Effect<A, E> {
        let def = self.def.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            Op::Succeed(ctx.refs().get(&def))
        }))
    }

    /// Replace the current fiber's value.
    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        let def = self.def.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            ctx.refs_mut().set(&def, Value::new(value.clone()));
            Op::unit()
        }))
    }

    /// Apply `f` to the current fiber's value.
    pub fn update<E: Data>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    /// Compute a result and a new value in one step.
    pub fn modify<B: Data, E: Data>(
        &self,
        f: impl Fn(A) -> (B, A) + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let def = self.def.clone();
        Effect::from_op(Op::with_runtime(move |ctx| {
            let current = ctx.refs().get(&def).downcast::<A>();
            let (out, next) = f(current);
            ctx.refs_mut().set(&def, Value::new(next));
            Op::Succeed(Value::new(out))
        }))
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set<E: Data>(&self, value: A) -> Effect<A, E> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Restore the initial value.
    pub fn reset<E: Data>(&self) -> Effect<(), E> {
        self.set(self.initial())
    }

    /// Run `effect` with the ref set to `value`, restoring the previous
    /// value afterwards, even on failure or interruption.
    pub fn locally<B: Data, E: Data>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        self.locally_with(move |_| value.clone(), effect)
    }

    /// Run `effect` with the ref set to `f(current)`, then restore it.
    pub fn locally_with<B: Data, E: Data>(
        &self,
        f: impl Fn(A) -> A + Send + Sync + 'static,
        effect: Effect<B, E>,
    ) -> Effect<B, E> {
        let def = self.def.clone();
        let f = Arc::new(f);
        Effect::uninterruptible_mask(move |restore| {
            let def = def.clone();
            let f = f.clone();
            let body = restore.apply(effect.clone()).op;
            Effect::from_op(Op::with_runtime(move |ctx| {
                let saved = ctx.refs().entry(&def);
                let next = f(ctx.refs().get(&def).downcast::<A>());
                ctx.refs_mut().set(&def, Value::new(next));
                let def = def.clone();
                let put_back = Op::with_runtime(move |ctx| {
                    ctx.refs_mut().restore(&def, saved.clone());
                    Op::unit()
                });
                body.clone().ensuring(put_back)
            }))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(2).build().unwrap()
    }

    #[test]
    fn test_patch_diff_and_apply() {
        let counter: FiberRef<i32> = FiberRef::new_with(0, |a| *a, |p, c| p + c);
        let mut parent = FiberRefs::default();
        parent.set(counter.def(), Value::new(10));

        let initial = parent.fork_all();
        let mut child = initial.clone();
        assert!(FiberRefsPatch::diff(&initial, &child).is_empty());

        child.set(counter.def(), Value::new(5));
        let patch = FiberRefsPatch::diff(&initial, &child);
        patch.apply(&mut parent);
        assert_eq!(parent.get(counter.def()).downcast::<i32>(), 15);
    }

    #[test]
    fn test_untouched_refs_leave_no_patch() {
        let rt = rt();
        let tag: FiberRef<&'static str> = FiberRef::new("root");
        let quiet = rt.run_fork(Effect::<i32>::succeed(1));
        let busy = rt.run_fork(tag.set::<std::convert::Infallible>("child"));
        rt.run_promise(quiet.await_exit::<std::convert::Infallible>()).wait().unwrap();
        rt.run_promise(busy.await_exit::<std::convert::Infallible>()).wait().unwrap();
        assert!(quiet.inner.refs_patch().is_none());
        assert!(busy.inner.refs_patch().is_some());
    }

    #[test]
    fn test_fork_function_applies_to_child() {
        let depth: FiberRef<u32> = FiberRef::new_with(0, |d| d + 1, |p, _| *p);
        let mut parent = FiberRefs::default();
        parent.set(depth.def(), Value::new(3u32));
        let child = parent.fork_all();
        assert_eq!(child.get(depth.def()).downcast::<u32>(), 4);
    }

    #[test]
    fn test_get_set_update() {
        let rt = rt();
        let r = FiberRef::new(1);
        let eff: Effect<i32> = r
            .set(5)
            .zip_right(r.update(|n| n * 2))
            .zip_right(r.get());
        assert_eq!(rt.run_sync(eff).unwrap(), 10);
    }

    #[test]
    fn test_locally_restores() {
        let rt = rt();
        let r = FiberRef::new("outer".to_string());
        let eff: Effect<(String, String)> = r
            .locally("inner".to_string(), r.get())
            .zip(r.get());
        let (inside, after) = rt.run_sync(eff).unwrap();
        assert_eq!(inside, "inner");
        assert_eq!(after, "outer");
    }

    #[test]
    fn test_locally_restores_on_failure() {
        let rt = rt();
        let r = FiberRef::new(0u8);
        let failing: Effect<(), String> = Effect::fail("x".into());
        let eff: Effect<u8, String> = r.locally(9, failing).either().widen_error().zip_right(r.get());
        assert_eq!(rt.run_sync(eff).unwrap(), 0);
    }

    #[test]
    fn test_join_inherits_child_value() {
        let rt = rt();
        let r = FiberRef::new(0);
        let eff: Effect<i32> = r
            .set(7)
            .fork()
            .flat_map(|fiber| fiber.join())
            .zip_right(r.get());
        assert_eq!(rt.run_sync(eff).unwrap(), 7);
    }

    #[test]
    fn test_child_sees_parent_value_at_fork() {
        let rt = rt();
        let r = FiberRef::new(1);
        let eff: Effect<i32> = r
            .set(42)
            .zip_right(r.get().fork())
            .flat_map(|fiber| fiber.join());
        assert_eq!(rt.run_sync(eff).unwrap(), 42);
    }
}
