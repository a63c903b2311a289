//! Hybrid-clock timestamp assignment for one tablet replica.

use std::sync::atomic::{AtomicU64, Ordering};

use slate_core::Timestamp;

/// Tracks the last timestamp this replica assigned to an operation.
///
/// The clock internals (physical time sampling, error bounds) live behind
/// the assignment interface; the consensus core only needs the guarantee
/// that assigned timestamps are strictly increasing and never fall behind a
/// timestamp learned from elsewhere in the cluster.
#[derive(Debug, Default)]
pub struct TimeManager {
    last_assigned: AtomicU64,
}

impl TimeManager {
    /// Creates a time manager starting at the minimum timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a time manager whose last-assigned timestamp is `initial`.
    #[must_use]
    pub fn with_initial(initial: Timestamp) -> Self {
        Self {
            last_assigned: AtomicU64::new(initial.get()),
        }
    }

    /// Returns the last timestamp assigned.
    #[must_use]
    pub fn last_assigned_timestamp(&self) -> Timestamp {
        Timestamp::new(self.last_assigned.load(Ordering::SeqCst))
    }

    /// Assigns the next timestamp, strictly greater than any assigned or
    /// learned before.
    #[must_use]
    pub fn assign_timestamp(&self) -> Timestamp {
        Timestamp::new(self.last_assigned.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Advances the clock so the last-assigned timestamp is at least
    /// `timestamp`.
    ///
    /// Used when a replica learns a timestamp chosen elsewhere (e.g. a
    /// finalized commit timestamp) and must not assign anything below it.
    pub fn update_clock_and_last_assigned_timestamp(&self, timestamp: Timestamp) {
        self.last_assigned
            .fetch_max(timestamp.get(), Ordering::SeqCst);
    }
}
