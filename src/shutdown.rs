//! Process wide termination signal shared by the worker threads.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Cloneable handle to a one way termination flag.
///
/// Waiting threads are woken as soon as the flag is set, so sleeping workers stop without running
/// out their timeouts.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag()
    }

    /// Blocks for at most `timeout`. Returns `true` if the shutdown was triggered.
    ///
    /// A timeout too large to be represented as an `Instant` waits without a deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };
        let mut triggered = self.flag();
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = self.inner.1
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Blocks until the shutdown is triggered.
    pub fn wait(&self) {
        let mut triggered = self.flag();
        while !*triggered {
            triggered = self.inner.1.wait(triggered).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
