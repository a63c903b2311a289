//! Replication progress tracking for one in-flight replicate.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use slate_core::{CountdownLatch, PeerId};
use tracing::warn;

use crate::opid::OpId;
use crate::quorum::QuorumSnapshot;

/// Tracks peer acknowledgements for one in-flight replicate and reports
/// when a majority of voting peers has the operation, and when all peers do.
///
/// The tracker counts blindly: preventing double-acks from the same peer is
/// the caller's responsibility.
pub struct MajorityTracker {
    op_id: OpId,
    majority: usize,
    voting_peers: HashSet<PeerId>,
    total_peers: usize,
    replicated_count: Mutex<usize>,
    completion_latch: CountdownLatch,
}

impl MajorityTracker {
    /// Creates a tracker for the given operation.
    ///
    /// `majority` acks from peers in `voting_peers` release waiters;
    /// `total_peers` is the full quorum size used by [`Self::is_all_done`].
    #[must_use]
    pub fn new(
        op_id: OpId,
        voting_peers: HashSet<PeerId>,
        majority: usize,
        total_peers: usize,
    ) -> Self {
        Self {
            op_id,
            majority,
            voting_peers,
            total_peers,
            replicated_count: Mutex::new(0),
            completion_latch: CountdownLatch::new(majority as u64),
        }
    }

    /// Creates a tracker for the given operation from a quorum snapshot.
    #[must_use]
    pub fn for_quorum(op_id: OpId, snapshot: &QuorumSnapshot) -> Self {
        Self::new(
            op_id,
            snapshot.voting_peers.clone(),
            snapshot.majority_size,
            snapshot.quorum_size,
        )
    }

    /// Records an acknowledgement from the given peer.
    ///
    /// Acks from voting peers count toward the majority; acks from
    /// non-voting peers only advance the all-peers count.
    ///
    /// # Panics
    /// Panics if the peer uuid is empty.
    pub fn ack(&self, peer_uuid: &PeerId) {
        assert!(!peer_uuid.is_empty(), "peer acked with empty uuid");
        let mut count = self.replicated_count.lock().expect("tracker lock poisoned");
        if self.voting_peers.contains(peer_uuid) {
            self.completion_latch.count_down();
        }
        *count += 1;
        debug_assert!(
            *count <= self.total_peers,
            "more acks than peers for {}: {} > {}",
            self.op_id,
            *count,
            self.total_peers
        );
    }

    /// Returns true once a majority of voting peers has acknowledged.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completion_latch.count() == 0
    }

    /// Returns true once every peer has acknowledged.
    #[must_use]
    pub fn is_all_done(&self) -> bool {
        *self.replicated_count.lock().expect("tracker lock poisoned") >= self.total_peers
    }

    /// Blocks until a majority of voting peers has acknowledged.
    pub fn wait(&self) {
        self.completion_latch.wait();
    }

    /// Returns the tracked operation id.
    #[must_use]
    pub const fn op_id(&self) -> OpId {
        self.op_id
    }
}

impl fmt::Display for MajorityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MajorityTracker: id: {} done: {} all peers: {}, voting peers: {}, \
             acked peers: {}, majority: {}",
            self.op_id,
            self.is_done(),
            self.total_peers,
            self.voting_peers.len(),
            *self.replicated_count.lock().expect("tracker lock poisoned"),
            self.majority
        )
    }
}

impl Drop for MajorityTracker {
    fn drop(&mut self) {
        // A leader abandoning a round drops its tracker before majority.
        if !self.is_done() {
            warn!(op_id = %self.op_id, "dropping incomplete replication tracker: {self}");
        }
    }
}
