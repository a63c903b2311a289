//! Per-transaction participant state.
//!
//! Each transaction a tablet participates in is tracked by a [`Txn`] whose
//! state machine is advanced only by replicated participant operations. The
//! op driving a transition owns the transaction's write lock from
//! acquisition in Prepare until release in Finish, so at most one
//! state-changing operation per transaction is in flight at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};
use slate_consensus::OpId;
use slate_core::{Timestamp, TxnId};

use crate::error::{TxnError, TxnResult};
use crate::mvcc::ScopedMvccOp;

/// State of a transaction on one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Created locally; `BEGIN_TXN` has not been applied yet.
    Initializing,
    /// Open for writes.
    Open,
    /// `BEGIN_COMMIT` applied; readers wait on the commit MVCC op.
    CommitInProgress,
    /// Commit finalized and visible.
    Committed,
    /// Aborted.
    Aborted,
}

impl TxnState {
    /// Returns the state's name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Open => "OPEN",
            Self::CommitInProgress => "COMMIT_IN_PROGRESS",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lockable interior of a transaction.
///
/// Validators check that a transition is legal from the current state;
/// mutators perform it and record the op id that drove it. The commit-op
/// slot holds the MVCC op opened at `BEGIN_COMMIT` until the commit is
/// finalized or aborted.
pub struct TxnInner {
    txn_id: TxnId,
    state: TxnState,
    commit_op: Option<ScopedMvccOp>,
    commit_timestamp: Option<Timestamp>,
    last_applied_op_id: Option<OpId>,
}

impl TxnInner {
    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    /// Returns the finalized commit timestamp, once committed.
    #[must_use]
    pub const fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_timestamp
    }

    /// Returns the id of the op that last mutated this transaction.
    #[must_use]
    pub const fn last_applied_op_id(&self) -> Option<OpId> {
        self.last_applied_op_id
    }

    /// Validates a `BEGIN_TXN` transition.
    ///
    /// # Errors
    /// Returns `IllegalTransition` if the transaction already left the
    /// initial state.
    pub fn validate_begin(&self) -> TxnResult<()> {
        self.validate(TxnState::Initializing, "BEGIN_TXN")
    }

    /// Validates a `BEGIN_COMMIT` transition.
    ///
    /// # Errors
    /// Returns `IllegalTransition` unless the transaction is open.
    pub fn validate_begin_commit(&self) -> TxnResult<()> {
        self.validate(TxnState::Open, "BEGIN_COMMIT")
    }

    /// Validates a `FINALIZE_COMMIT` transition.
    ///
    /// # Errors
    /// Returns `IllegalTransition` unless a commit is in progress.
    pub fn validate_finalize(&self) -> TxnResult<()> {
        self.validate(TxnState::CommitInProgress, "FINALIZE_COMMIT")
    }

    /// Validates an `ABORT_TXN` transition.
    ///
    /// # Errors
    /// Returns `IllegalTransition` unless the transaction is open or a
    /// commit is in progress; aborting an already-aborted transaction is
    /// reported to the caller.
    pub fn validate_abort(&self) -> TxnResult<()> {
        match self.state {
            TxnState::Open | TxnState::CommitInProgress => Ok(()),
            state => Err(TxnError::IllegalTransition {
                txn_id: self.txn_id,
                op: "ABORT_TXN",
                state,
            }),
        }
    }

    fn validate(&self, required: TxnState, op: &'static str) -> TxnResult<()> {
        if self.state == required {
            return Ok(());
        }
        Err(TxnError::IllegalTransition {
            txn_id: self.txn_id,
            op,
            state: self.state,
        })
    }

    /// Opens the transaction.
    pub fn begin(&mut self, op_id: OpId) {
        debug_assert_eq!(self.state, TxnState::Initializing);
        self.state = TxnState::Open;
        self.last_applied_op_id = Some(op_id);
    }

    /// Moves the transaction into commit-in-progress.
    pub fn begin_commit(&mut self, op_id: OpId) {
        debug_assert_eq!(self.state, TxnState::Open);
        self.state = TxnState::CommitInProgress;
        self.last_applied_op_id = Some(op_id);
    }

    /// Finalizes the commit at the coordinator-chosen timestamp.
    pub fn finalize_commit(&mut self, op_id: OpId, commit_timestamp: Timestamp) {
        debug_assert_eq!(self.state, TxnState::CommitInProgress);
        self.state = TxnState::Committed;
        self.commit_timestamp = Some(commit_timestamp);
        self.last_applied_op_id = Some(op_id);
    }

    /// Aborts the transaction.
    pub fn abort(&mut self, op_id: OpId) {
        debug_assert!(matches!(
            self.state,
            TxnState::Open | TxnState::CommitInProgress
        ));
        self.state = TxnState::Aborted;
        self.last_applied_op_id = Some(op_id);
    }

    /// Hands the commit MVCC op to the transaction.
    ///
    /// # Panics
    /// Panics if a commit op is already held.
    pub fn set_commit_op(&mut self, op: ScopedMvccOp) {
        assert!(
            self.commit_op.is_none(),
            "transaction {} already holds a commit op",
            self.txn_id
        );
        self.commit_op = Some(op);
    }

    /// Takes the commit MVCC op out of the transaction, if one is held.
    pub fn take_commit_op(&mut self) -> Option<ScopedMvccOp> {
        self.commit_op.take()
    }

    /// Returns true if the transaction holds a commit MVCC op.
    #[must_use]
    pub const fn has_commit_op(&self) -> bool {
        self.commit_op.is_some()
    }
}

/// Write-lock guard for a transaction, owned by the participant op driving
/// its current transition.
pub type TxnWriteGuard = ArcRwLockWriteGuard<RawRwLock, TxnInner>;

/// Handle to one transaction tracked by the participant.
#[derive(Clone)]
pub struct Txn {
    txn_id: TxnId,
    inner: Arc<RwLock<TxnInner>>,
}

impl Txn {
    fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            inner: Arc::new(RwLock::new(TxnInner {
                txn_id,
                state: TxnState::Initializing,
                commit_op: None,
                commit_timestamp: None,
                last_applied_op_id: None,
            })),
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.txn_id
    }

    /// Acquires the transaction's exclusive write lock.
    ///
    /// Blocks until any current holder releases it. The guard is owned, so
    /// it can be held across participant op phases.
    #[must_use]
    pub fn acquire_write_lock(&self) -> TxnWriteGuard {
        self.inner.write_arc()
    }

    /// Returns the current state.
    ///
    /// Blocks while an op holds the write lock.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.inner.read().state
    }

    /// Returns true if the transaction holds a commit MVCC op.
    #[must_use]
    pub fn has_commit_op(&self) -> bool {
        self.inner.read().has_commit_op()
    }

    fn try_state(&self) -> Option<TxnState> {
        self.inner.try_read().map(|inner| inner.state)
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("txn_id", &self.txn_id)
            .field("state", &self.try_state())
            .finish_non_exhaustive()
    }
}

/// Registry of the transactions this tablet participates in.
#[derive(Debug, Default)]
pub struct TxnParticipant {
    txns: Mutex<HashMap<TxnId, Txn>>,
}

impl TxnParticipant {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction with the given id, creating it in the
    /// initializing state if unknown.
    #[must_use]
    pub fn get_or_create(&self, txn_id: TxnId) -> Txn {
        self.txns
            .lock()
            .expect("txn registry lock poisoned")
            .entry(txn_id)
            .or_insert_with(|| Txn::new(txn_id))
            .clone()
    }

    /// Returns the transaction with the given id, if known.
    #[must_use]
    pub fn get(&self, txn_id: TxnId) -> Option<Txn> {
        self.txns
            .lock()
            .expect("txn registry lock poisoned")
            .get(&txn_id)
            .cloned()
    }

    /// Removes a transaction that never made it out of the initializing
    /// state, after its creating op aborted.
    ///
    /// A transaction whose write lock is currently held is skipped: the
    /// holder will settle its state.
    pub fn clear_if_init_failed(&self, txn_id: TxnId) {
        let mut txns = self.txns.lock().expect("txn registry lock poisoned");
        if let Some(txn) = txns.get(&txn_id) {
            if txn.try_state() == Some(TxnState::Initializing) {
                txns.remove(&txn_id);
            }
        }
    }

    /// Returns the number of tracked transactions.
    #[must_use]
    pub fn num_txns(&self) -> usize {
        self.txns.lock().expect("txn registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use slate_core::{LogIndex, TermId};

    use super::*;

    fn op(term: u64, index: u64) -> OpId {
        OpId::new(TermId::new(term), LogIndex::new(index))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let participant = TxnParticipant::new();
        let a = participant.get_or_create(TxnId::new(1));
        let b = participant.get_or_create(TxnId::new(1));
        assert_eq!(a.id(), b.id());
        assert_eq!(participant.num_txns(), 1);
        assert_eq!(a.state(), TxnState::Initializing);
    }

    #[test]
    fn test_happy_path_transitions() {
        let txn = Txn::new(TxnId::new(1));
        let mut guard = txn.acquire_write_lock();

        guard.validate_begin().unwrap();
        guard.begin(op(1, 1));
        assert_eq!(guard.state(), TxnState::Open);

        guard.validate_begin_commit().unwrap();
        guard.begin_commit(op(1, 2));
        assert_eq!(guard.state(), TxnState::CommitInProgress);

        guard.validate_finalize().unwrap();
        guard.finalize_commit(op(1, 3), Timestamp::new(105));
        assert_eq!(guard.state(), TxnState::Committed);
        assert_eq!(guard.commit_timestamp(), Some(Timestamp::new(105)));
        assert_eq!(guard.last_applied_op_id(), Some(op(1, 3)));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let txn = Txn::new(TxnId::new(2));
        let mut guard = txn.acquire_write_lock();

        // Not open yet.
        assert!(guard.validate_begin_commit().is_err());
        assert!(guard.validate_finalize().is_err());
        assert!(guard.validate_abort().is_err());

        guard.begin(op(1, 1));
        // Already begun.
        assert!(matches!(
            guard.validate_begin(),
            Err(TxnError::IllegalTransition {
                op: "BEGIN_TXN",
                state: TxnState::Open,
                ..
            })
        ));
        // Finalize without a commit in progress.
        assert!(guard.validate_finalize().is_err());
    }

    #[test]
    fn test_abort_from_open_and_commit_in_progress() {
        let txn = Txn::new(TxnId::new(3));
        let mut guard = txn.acquire_write_lock();
        guard.begin(op(1, 1));
        guard.validate_abort().unwrap();

        guard.begin_commit(op(1, 2));
        guard.validate_abort().unwrap();
        guard.abort(op(1, 3));
        assert_eq!(guard.state(), TxnState::Aborted);

        // Idempotent abort is reported as a failure.
        assert!(matches!(
            guard.validate_abort(),
            Err(TxnError::IllegalTransition {
                state: TxnState::Aborted,
                ..
            })
        ));
    }

    #[test]
    fn test_clear_if_init_failed_removes_only_initializing() {
        let participant = TxnParticipant::new();
        let txn = participant.get_or_create(TxnId::new(1));
        participant.clear_if_init_failed(TxnId::new(1));
        assert!(participant.get(TxnId::new(1)).is_none());

        let txn2 = participant.get_or_create(TxnId::new(2));
        {
            let mut guard = txn2.acquire_write_lock();
            guard.begin(op(1, 1));
        }
        participant.clear_if_init_failed(TxnId::new(2));
        assert!(participant.get(TxnId::new(2)).is_some());
        drop(txn);
    }

    #[test]
    fn test_clear_if_init_failed_skips_locked_txn() {
        let participant = TxnParticipant::new();
        let txn = participant.get_or_create(TxnId::new(1));
        let _guard = txn.acquire_write_lock();
        participant.clear_if_init_failed(TxnId::new(1));
        assert!(participant.get(TxnId::new(1)).is_some());
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let txn = Txn::new(TxnId::new(1));
        let guard = txn.acquire_write_lock();
        assert!(txn.inner.try_write().is_none());
        drop(guard);
        assert!(txn.inner.try_write().is_some());
    }
}
