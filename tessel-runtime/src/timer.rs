//! # Timer Wheel Thread
//!
//! A single background thread fires delayed callbacks. `Effect::sleep`
//! registers a callback that resumes the sleeping fiber, so no worker thread
//! ever blocks on time.
//!
//! Deadlines live in a binary heap; cancelled entries are dropped lazily
//! when they reach the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cause::Defect;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Delayed-callback service owned by a runtime.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start the timer thread.
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("tessel-timer".into())
            .spawn(move || run(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `f` on the timer thread after `delay`.
    ///
    /// After shutdown the callback is dropped without running.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerKey {
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            return TimerKey(key);
        }
        let deadline = Instant::now() + delay;
        let is_earliest = state
            .deadlines
            .peek()
            .map_or(true, |Reverse((first, _))| deadline < *first);
        state.deadlines.push(Reverse((deadline, key)));
        state.callbacks.insert(key, Box::new(f));
        if is_earliest {
            self.shared.wakeup.notify_one();
        }
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns false if it already fired.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stop the timer thread, dropping pending callbacks.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.callbacks.clear();
            state.deadlines.clear();
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        let now = Instant::now();
        match state.deadlines.peek().copied() {
            Some(Reverse((deadline, key))) if deadline <= now => {
                state.deadlines.pop();
                if let Some(callback) = state.callbacks.remove(&key) {
                    MutexGuard::unlocked(&mut state, || fire(callback));
                }
            }
            Some(Reverse((deadline, _))) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

fn fire(callback: Callback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let defect = Defect::from_panic(payload);
        tracing::error!(%defect, "timer callback panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::start().unwrap();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(30, 'c'), (10, 'a'), (20, 'b')] {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(delay), move || tx.send(tag).unwrap());
        }
        let got: String = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, "abc");
    }

    #[test]
    fn test_cancel() {
        let timer = Timer::start().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let key = timer.schedule(Duration::from_millis(20), move || tx.send(()).unwrap());
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timer = Timer::start().unwrap();
        timer.schedule(Duration::from_secs(60), || {});
        assert_eq!(timer.pending(), 1);
        timer.shutdown();
        assert_eq!(timer.pending(), 0);
    }
}
