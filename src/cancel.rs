use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// A shared flag that tells every thread of the daemon to wind down.
///
/// Clones share the same flag. Once cancelled, a token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel, waking everyone blocked in [`CancelToken::wait_timeout`].
    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.wake.notify_all();
    }

    /// True once [`CancelToken::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `timeout`, or until cancelled. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

#[test]
fn wait_times_out() {
    let t = CancelToken::new();
    let start = Instant::now();
    assert!(!t.wait_timeout(Duration::from_millis(20)));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(!t.is_cancelled());
}

#[test]
fn cancel_wakes_waiters() {
    let t = CancelToken::new();
    let t2 = t.clone();
    let waiter = std::thread::spawn(move || t2.wait_timeout(Duration::from_secs(30)));
    std::thread::sleep(Duration::from_millis(10));
    t.cancel();
    assert!(waiter.join().unwrap());
    assert!(t.is_cancelled());
    // stays cancelled
    assert!(t.wait_timeout(Duration::from_secs(30)));
}
