//! Set-once, waitable signal shared between threads.
//!
//! Used for per-turn cancellation and process-wide shutdown. Waiters park on a
//! condition variable and wake as soon as the signal is raised, so loops that
//! used to sleep-and-poll get immediate notification instead.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    raised: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// A cloneable handle to a one-shot boolean signal.
///
/// Once raised it stays raised; there is no reset. Create a new `Signal`
/// for every scope that needs one.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

/// Process-wide stop request observed by every background loop.
pub type ShutdownSignal = Signal;

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that actually
    /// transitioned it; later calls are no-ops.
    pub fn raise(&self) -> bool {
        if self.inner.raised.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
        true
    }

    /// Non-blocking read.
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Block up to `timeout` for the signal. Returns whether it is raised.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_raised() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_raised() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_raised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn raise_is_effective_once() {
        let s = Signal::new();
        assert!(!s.is_raised());
        assert!(s.raise());
        assert!(!s.raise());
        assert!(s.is_raised());
    }

    #[test]
    fn wait_times_out_when_not_raised() {
        let s = Signal::new();
        let start = Instant::now();
        assert!(!s.wait_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn waiter_wakes_early_on_raise() {
        let s = Signal::new();
        let remote = s.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.raise();
        });
        let start = Instant::now();
        assert!(s.wait_for(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn clones_share_state() {
        let a = Signal::new();
        let b = a.clone();
        b.raise();
        assert!(a.is_raised());
        assert!(!Signal::new().is_raised());
    }
}
