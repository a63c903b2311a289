//! A countdown latch for blocking drains.
//!
//! Used by the replica shutdown path (wait for outstanding applies) and by
//! the replication majority tracker (wait for majority ACK).

use std::sync::{Condvar, Mutex};

/// A latch that releases all waiters once its count reaches zero.
///
/// The count can be re-armed with [`CountdownLatch::reset`]; waiters present
/// during a reset observe the new count.
#[derive(Debug)]
pub struct CountdownLatch {
    count: Mutex<u64>,
    released: Condvar,
}

impl CountdownLatch {
    /// Creates a latch armed with the given count.
    ///
    /// A count of zero creates an already-released latch.
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    /// Decrements the count, releasing waiters when it reaches zero.
    ///
    /// Counting down an already-released latch is a no-op.
    pub fn count_down(&self) {
        let mut count = self.count.lock().expect("latch lock poisoned");
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.released.notify_all();
        }
    }

    /// Returns the current count.
    #[must_use]
    pub fn count(&self) -> u64 {
        *self.count.lock().expect("latch lock poisoned")
    }

    /// Re-arms the latch with a new count.
    ///
    /// Resetting to zero releases all current waiters.
    pub fn reset(&self, count: u64) {
        let mut guard = self.count.lock().expect("latch lock poisoned");
        *guard = count;
        if count == 0 {
            self.released.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("latch lock poisoned");
        while *count > 0 {
            count = self.released.wait(count).expect("latch lock poisoned");
        }
    }
}
