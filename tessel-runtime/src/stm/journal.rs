//! Transaction logs and the commit protocol.
//!
//! A [`Journal`] maps each touched ref to the version observed on first
//! access and the transaction's private view of its value. Live memory is
//! only changed by [`Journal::commit`], which runs under the global commit
//! lock: every recorded version must still be current, otherwise nothing
//! is written.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::effect::Op;
use crate::fiber::FiberId;
use crate::fiber_runtime::Resume;
use crate::value::Value;

/// Serializes validation with publication of writes and waiter
/// registration.
static COMMIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAITER_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) fn commit_lock() -> MutexGuard<'static, ()> {
    COMMIT_LOCK.lock()
}

pub(crate) fn next_waiter_key() -> u64 {
    NEXT_WAITER_KEY.fetch_add(1, Ordering::Relaxed)
}

struct Versioned {
    version: u64,
    value: Value,
}

/// A fiber parked on `retry`, with the op that re-runs its transaction.
struct Waiter {
    resume: Resume,
    rerun: Op,
}

/// Untyped storage behind a `TRef`.
pub(crate) struct RefSlot {
    id: u64,
    cell: Mutex<Versioned>,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl RefSlot {
    pub(crate) fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            cell: Mutex::new(Versioned { version: 0, value }),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.cell.lock().version
    }

    fn snapshot(&self) -> (u64, Value) {
        let cell = self.cell.lock();
        (cell.version, cell.value.clone())
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefSlot")
            .field("id", &self.id)
            .field("version", &self.version())
            .finish()
    }
}

#[derive(Clone)]
struct Entry {
    cell: Arc<RefSlot>,
    expected: u64,
    /// Value at `expected`, as first read.
    original: Value,
    value: Value,
    written: bool,
}

/// A read saw a snapshot inconsistent with earlier reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Inconsistent;

/// The private log of one transaction attempt.
#[derive(Clone)]
pub(crate) struct Journal {
    fiber_id: FiberId,
    entries: BTreeMap<u64, Entry>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("fiber_id", &self.fiber_id)
            .field("refs", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Journal {
    pub(crate) fn new(fiber_id: FiberId) -> Self {
        Self {
            fiber_id,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn fiber_id(&self) -> &FiberId {
        &self.fiber_id
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The transaction's view of `cell`.
    ///
    /// First access records the live version. Earlier reads are revalidated
    /// and the new ref sampled under the commit lock, so together they form
    /// a snapshot no commit was halfway through publishing.
    pub(crate) fn read(&mut self, cell: &Arc<RefSlot>) -> Result<Value, Inconsistent> {
        if let Some(entry) = self.entries.get(&cell.id) {
            return Ok(entry.value.clone());
        }
        let (version, value) = {
            let _guard = commit_lock();
            if !self.is_valid() {
                return Err(Inconsistent);
            }
            cell.snapshot()
        };
        self.entries.insert(
            cell.id,
            Entry {
                cell: cell.clone(),
                expected: version,
                original: value.clone(),
                value: value.clone(),
                written: false,
            },
        );
        Ok(value)
    }

    pub(crate) fn write(&mut self, cell: &Arc<RefSlot>, value: Value) -> Result<(), Inconsistent> {
        self.read(cell)?;
        if let Some(entry) = self.entries.get_mut(&cell.id) {
            entry.value = value;
            entry.written = true;
        }
        Ok(())
    }

    /// Whether every recorded version is still live.
    pub(crate) fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.cell.version() == entry.expected)
    }

    /// Drop this journal's writes, keeping what it read.
    ///
    /// Used when an `or_else` branch is abandoned: its reads still matter
    /// for validation and for deciding which refs wake a retry.
    pub(crate) fn rollback_to(&mut self, mut snapshot: Journal) {
        for (id, entry) in mem::take(&mut self.entries) {
            snapshot.entries.entry(id).or_insert_with(|| Entry {
                value: entry.original.clone(),
                written: false,
                ..entry
            });
        }
        *self = snapshot;
    }

    /// Validate and publish writes. Returns `false` with nothing written
    /// if a recorded version went stale.
    pub(crate) fn commit(&self) -> bool {
        let woken = {
            let _guard = commit_lock();
            if !self.is_valid() {
                return false;
            }
            let mut woken = Vec::new();
            for entry in self.entries.values().filter(|e| e.written) {
                {
                    let mut cell = entry.cell.cell.lock();
                    cell.version += 1;
                    cell.value = entry.value.clone();
                }
                woken.extend(mem::take(&mut *entry.cell.waiters.lock()).into_values());
            }
            woken
        };
        if !woken.is_empty() {
            tracing::trace!(fiber = %self.fiber_id, woken = woken.len(), "stm commit woke waiters");
        }
        for waiter in woken {
            waiter.resume.resume(waiter.rerun);
        }
        true
    }

    /// Validate without publishing; used when the transaction failed.
    pub(crate) fn validate(&self) -> bool {
        let _guard = commit_lock();
        self.is_valid()
    }

    /// Park `resume` under `key` on every ref this journal read.
    ///
    /// Returns `false` if the journal went stale first, in which case the
    /// caller re-runs immediately.
    pub(crate) fn park(&self, key: u64, resume: &Resume, rerun: Op) -> bool {
        let _guard = commit_lock();
        if !self.is_valid() {
            return false;
        }
        for entry in self.entries.values() {
            entry.cell.waiters.lock().insert(
                key,
                Waiter {
                    resume: resume.clone(),
                    rerun: rerun.clone(),
                },
            );
        }
        true
    }

    /// Remove a parked waiter from every ref.
    pub(crate) fn unpark(&self, key: u64) {
        for entry in self.entries.values() {
            entry.cell.waiters.lock().remove(&key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
