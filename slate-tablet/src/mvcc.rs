//! Multi-version concurrency control op handles.
//!
//! An MVCC op represents an in-progress write at a specific timestamp;
//! readers at later timestamps wait for it to resolve. The consensus core
//! only opens, applies, finishes, and aborts ops; snapshot construction and
//! reader waiting live with the storage engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use slate_core::Timestamp;
use tracing::warn;

/// Phase of one MVCC op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvccOpPhase {
    /// Registered; the write has not started applying.
    Open,
    /// The write is being applied.
    Applying,
    /// The write is visible to readers at or after its timestamp.
    Applied,
    /// The write was abandoned; readers skip it.
    Aborted,
}

impl MvccOpPhase {
    /// Returns true while readers at later timestamps must wait on the op.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Applying)
    }
}

/// Registry of MVCC ops for one tablet.
#[derive(Debug, Default)]
pub struct MvccManager {
    ops: Mutex<HashMap<Timestamp, MvccOpPhase>>,
}

impl MvccManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an MVCC op at the given timestamp.
    ///
    /// Readers at later timestamps wait until the returned handle is
    /// finished or aborted. Dropping the handle without finishing aborts
    /// the op.
    ///
    /// # Panics
    /// Panics if an op is already registered at this timestamp; timestamps
    /// are assigned uniquely by the time manager.
    #[must_use]
    pub fn start_op(mvcc: &Arc<Self>, timestamp: Timestamp) -> ScopedMvccOp {
        let previous = mvcc
            .ops
            .lock()
            .expect("mvcc lock poisoned")
            .insert(timestamp, MvccOpPhase::Open);
        assert!(
            previous.is_none(),
            "mvcc op already registered at {timestamp}"
        );
        ScopedMvccOp {
            mvcc: Arc::clone(mvcc),
            timestamp,
            done: false,
        }
    }

    /// Returns the phase of the op at the given timestamp, if one exists.
    #[must_use]
    pub fn op_phase(&self, timestamp: Timestamp) -> Option<MvccOpPhase> {
        self.ops
            .lock()
            .expect("mvcc lock poisoned")
            .get(&timestamp)
            .copied()
    }

    /// Returns the number of ops readers may still be waiting on.
    #[must_use]
    pub fn num_active_ops(&self) -> usize {
        self.ops
            .lock()
            .expect("mvcc lock poisoned")
            .values()
            .filter(|phase| phase.is_active())
            .count()
    }

    fn transition(&self, timestamp: Timestamp, to: MvccOpPhase) {
        let mut ops = self.ops.lock().expect("mvcc lock poisoned");
        let phase = ops
            .get_mut(&timestamp)
            .unwrap_or_else(|| panic!("no mvcc op registered at {timestamp}"));
        assert!(
            phase.is_active(),
            "mvcc op at {timestamp} already resolved as {phase:?}"
        );
        *phase = to;
    }
}

/// Owned handle to one open MVCC op.
///
/// The handle is owned by the participant op state between Start and Apply,
/// then by the transaction until the commit is finalized or aborted.
pub struct ScopedMvccOp {
    mvcc: Arc<MvccManager>,
    timestamp: Timestamp,
    done: bool,
}

impl ScopedMvccOp {
    /// Returns the op's timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Marks the op as applying.
    pub fn start_applying(&self) {
        self.mvcc.transition(self.timestamp, MvccOpPhase::Applying);
    }

    /// Completes the op, making the write visible to readers.
    pub fn finish_applying(mut self) {
        self.mvcc.transition(self.timestamp, MvccOpPhase::Applied);
        self.done = true;
    }

    /// Abandons the op; readers skip the write.
    pub fn abort(mut self) {
        self.mvcc.transition(self.timestamp, MvccOpPhase::Aborted);
        self.done = true;
    }
}

impl Drop for ScopedMvccOp {
    fn drop(&mut self) {
        if !self.done {
            warn!(timestamp = %self.timestamp, "dropping unresolved mvcc op, aborting it");
            self.mvcc.transition(self.timestamp, MvccOpPhase::Aborted);
        }
    }
}

impl std::fmt::Debug for ScopedMvccOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedMvccOp")
            .field("timestamp", &self.timestamp)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: u64) -> Timestamp {
        Timestamp::new(value)
    }

    #[test]
    fn test_op_lifecycle_to_applied() {
        let mvcc = Arc::new(MvccManager::new());
        let op = MvccManager::start_op(&mvcc, ts(100));
        assert_eq!(mvcc.op_phase(ts(100)), Some(MvccOpPhase::Open));
        assert_eq!(mvcc.num_active_ops(), 1);

        op.start_applying();
        assert_eq!(mvcc.op_phase(ts(100)), Some(MvccOpPhase::Applying));

        op.finish_applying();
        assert_eq!(mvcc.op_phase(ts(100)), Some(MvccOpPhase::Applied));
        assert_eq!(mvcc.num_active_ops(), 0);
    }

    #[test]
    fn test_abort_resolves_op() {
        let mvcc = Arc::new(MvccManager::new());
        let op = MvccManager::start_op(&mvcc, ts(100));
        op.abort();
        assert_eq!(mvcc.op_phase(ts(100)), Some(MvccOpPhase::Aborted));
    }

    #[test]
    fn test_drop_without_finishing_aborts() {
        let mvcc = Arc::new(MvccManager::new());
        drop(MvccManager::start_op(&mvcc, ts(50)));
        assert_eq!(mvcc.op_phase(ts(50)), Some(MvccOpPhase::Aborted));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_timestamp_panics() {
        let mvcc = Arc::new(MvccManager::new());
        let _first = MvccManager::start_op(&mvcc, ts(1));
        let _second = MvccManager::start_op(&mvcc, ts(1));
    }

    #[test]
    #[should_panic(expected = "already resolved")]
    fn test_double_resolution_panics() {
        let mvcc = Arc::new(MvccManager::new());
        let op = MvccManager::start_op(&mvcc, ts(1));
        op.abort();
        mvcc.transition(ts(1), MvccOpPhase::Applied);
    }
}
