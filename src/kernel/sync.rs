//! Kernel synchronization primitives
//!
//! All kernel state lives behind one mutex (the kernel lock), so every
//! operation executes as if single-threaded with respect to the others.
//! Blocking operations suspend through a `Condv`: the wait atomically
//! releases the kernel lock and reacquires it on wake. Wakes are always
//! broadcast ("wake all"), so every waiter sits in a loop that revalidates
//! its predicate after each wake - state may have changed between the
//! broadcast and this waiter's turn to run.

use std::sync::{Arc, Condvar, MutexGuard};
use std::time::Duration;

/// Scheduling class recorded on each wait.
///
/// The dispatcher uses this for fairness bucketing; it has no effect on
/// correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Thread-level waits (join, child reaping)
    User,
    /// Stream rendezvous waits (accept, connect admission)
    Pipe,
}

impl std::fmt::Display for SchedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedClass::User => write!(f, "USER"),
            SchedClass::Pipe => write!(f, "PIPE"),
        }
    }
}

/// A condition-variable handle bound to the kernel lock.
///
/// Handles are cheaply cloneable; a waiter clones the handle out of the
/// state it is about to release so the wait can outlive its borrow.
#[derive(Debug, Clone)]
pub struct Condv {
    inner: Arc<Condvar>,
}

impl Condv {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Condvar::new()),
        }
    }

    /// Block until broadcast. Releases the kernel lock while suspended.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>, class: SchedClass) -> MutexGuard<'a, T> {
        log::trace!("blocking wait ({class})");
        self.inner.wait(guard).expect("kernel lock poisoned")
    }

    /// Block until broadcast or until `timeout` elapses.
    ///
    /// The boolean is true when the wake was a timeout. Callers must still
    /// recheck their predicate first: a broadcast can race the deadline.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        class: SchedClass,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        log::trace!("timed wait ({class}, {timeout:?})");
        let (guard, result) = self
            .inner
            .wait_timeout(guard, timeout)
            .expect("kernel lock poisoned");
        (guard, result.timed_out())
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

impl Default for Condv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn test_timed_wait_times_out() {
        let lock = Mutex::new(());
        let cv = Condv::new();

        let guard = lock.lock().unwrap();
        let start = Instant::now();
        let (_guard, timed_out) =
            cv.wait_timeout(guard, SchedClass::Pipe, Duration::from_millis(50));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_broadcast_wakes_all_waiters() {
        let lock = Arc::new(Mutex::new(0u32));
        let cv = Condv::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let cv = cv.clone();
            handles.push(std::thread::spawn(move || {
                let mut guard = lock.lock().unwrap();
                while *guard == 0 {
                    guard = cv.wait(guard, SchedClass::User);
                }
            }));
        }

        // Let the waiters park, then release them all at once.
        std::thread::sleep(Duration::from_millis(50));
        *lock.lock().unwrap() = 1;
        cv.broadcast();

        for h in handles {
            h.join().unwrap();
        }
    }
}
