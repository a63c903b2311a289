//! Replicated transaction participant operations.
//!
//! One [`ParticipantOp`] drives one step of a transaction's state machine
//! through consensus, in four phases:
//!
//! 1. **Prepare** (leader and replica): acquire the transaction and its
//!    write lock, validate the transition. On the leader, a finalize also
//!    advances the clock past the finalized commit timestamp.
//! 2. **Start**: copy the replicate message's consensus timestamp into the
//!    op; a `BEGIN_COMMIT` opens an MVCC op at that timestamp so readers at
//!    later timestamps wait for the commit to resolve.
//! 3. **Apply** (after consensus majority): run the transaction mutator and
//!    settle MVCC ownership, producing a commit message.
//! 4. **Finish**: release the write lock; an aborted op clears a
//!    half-initialized transaction entry.

use std::fmt;
use std::sync::Arc;

use slate_consensus::{
    CommitMsg, OpId, ParticipantOpType, ParticipantRequest, ParticipantResponse, ReplicateMsg,
};
use slate_core::Timestamp;
use tracing::debug;

use crate::clock::TimeManager;
use crate::error::{TxnError, TxnResult};
use crate::mvcc::{MvccManager, ScopedMvccOp};
use crate::txn::{TxnParticipant, TxnWriteGuard};

/// Whether this replica drives the op as leader or applies it as a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    /// The op originates on this replica.
    Leader,
    /// The op was replicated from the leader.
    Replica,
}

/// Terminal outcome of a participant op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// The op was applied.
    Applied,
    /// The op was aborted before applying.
    Aborted,
}

/// Mutable state of one participant op, handed from phase to phase.
pub struct ParticipantOpState {
    request: ParticipantRequest,
    response: ParticipantResponse,
    txn_guard: Option<TxnWriteGuard>,
    op_id: Option<OpId>,
    timestamp: Option<Timestamp>,
    begin_commit_mvcc_op: Option<ScopedMvccOp>,
}

impl ParticipantOpState {
    /// Creates op state for the given request.
    #[must_use]
    pub const fn new(request: ParticipantRequest) -> Self {
        Self {
            request,
            response: ParticipantResponse { error: None },
            txn_guard: None,
            op_id: None,
            timestamp: None,
            begin_commit_mvcc_op: None,
        }
    }

    /// Returns the request being driven.
    #[must_use]
    pub const fn request(&self) -> &ParticipantRequest {
        &self.request
    }

    /// Returns the response being built.
    #[must_use]
    pub const fn response(&self) -> &ParticipantResponse {
        &self.response
    }

    /// Returns the transaction id this op targets.
    #[must_use]
    pub const fn txn_id(&self) -> slate_core::TxnId {
        self.request.op.txn_id
    }

    /// Returns the op type.
    #[must_use]
    pub const fn op_type(&self) -> ParticipantOpType {
        self.request.op.op_type
    }

    /// Returns the consensus timestamp, once assigned in Start.
    #[must_use]
    pub const fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    fn acquire_txn_and_lock(&mut self, participant: &TxnParticipant) {
        debug_assert!(self.txn_guard.is_none(), "transaction already acquired");
        let txn = participant.get_or_create(self.txn_id());
        self.txn_guard = Some(txn.acquire_write_lock());
    }

    fn release_txn(&mut self) {
        self.txn_guard = None;
        debug!(txn_id = %self.txn_id(), "released txn lock");
    }

    fn validate_op(&self) -> TxnResult<()> {
        let guard = self.txn_guard.as_ref().expect("transaction not acquired");
        match self.op_type() {
            ParticipantOpType::BeginTxn => guard.validate_begin(),
            ParticipantOpType::BeginCommit => guard.validate_begin_commit(),
            ParticipantOpType::FinalizeCommit => {
                if self.request.op.finalized_commit_timestamp.is_none() {
                    return Err(TxnError::invalid_argument(
                        "FINALIZE_COMMIT requires a finalized commit timestamp",
                    ));
                }
                guard.validate_finalize()
            }
            ParticipantOpType::AbortTxn => guard.validate_abort(),
            ParticipantOpType::Unknown => Err(TxnError::invalid_argument("unknown op type")),
        }
    }

    fn set_mvcc_op(&mut self, mvcc_op: ScopedMvccOp) {
        debug_assert_eq!(self.op_type(), ParticipantOpType::BeginCommit);
        debug_assert!(self.begin_commit_mvcc_op.is_none());
        self.begin_commit_mvcc_op = Some(mvcc_op);
    }

    fn release_mvcc_op_to_txn(&mut self) {
        debug_assert_eq!(self.op_type(), ParticipantOpType::BeginCommit);
        let mvcc_op = self
            .begin_commit_mvcc_op
            .take()
            .expect("no mvcc op to release");
        self.txn_guard
            .as_mut()
            .expect("transaction not acquired")
            .set_commit_op(mvcc_op);
    }

    fn perform_op(&mut self, op_id: OpId) -> TxnResult<CommitMsg> {
        let guard = self.txn_guard.as_mut().expect("transaction not acquired");
        match self.request.op.op_type {
            ParticipantOpType::BeginTxn => guard.begin(op_id),
            ParticipantOpType::BeginCommit => guard.begin_commit(op_id),
            ParticipantOpType::FinalizeCommit => {
                let commit_timestamp = self
                    .request
                    .op
                    .finalized_commit_timestamp
                    .expect("validated in prepare");
                guard.finalize_commit(op_id, commit_timestamp);
                // Bootstrap replay may find no commit op: the BEGIN_COMMIT
                // was fully applied in a previous incarnation.
                if let Some(commit_op) = guard.take_commit_op() {
                    commit_op.finish_applying();
                }
            }
            ParticipantOpType::AbortTxn => {
                guard.abort(op_id);
                if let Some(commit_op) = guard.take_commit_op() {
                    commit_op.abort();
                }
            }
            ParticipantOpType::Unknown => {
                return Err(TxnError::invalid_argument("unknown op type"));
            }
        }
        Ok(CommitMsg::participant())
    }
}

impl fmt::Debug for ParticipantOpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantOpState")
            .field("op_type", &self.op_type().as_str())
            .field("txn_id", &self.txn_id())
            .field("op_id", &self.op_id)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ParticipantOpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op_id = self
            .op_id
            .map_or_else(|| "<unassigned>".to_string(), |id| id.to_string());
        let ts = self
            .timestamp
            .map_or_else(|| "<unassigned>".to_string(), |ts| ts.to_string());
        write!(
            f,
            "ParticipantOpState [op_id={op_id}, ts={ts}, type={}]",
            self.op_type().as_str()
        )
    }
}

/// A participant op being driven through its four phases.
pub struct ParticipantOp {
    state: ParticipantOpState,
    driver: DriverType,
    participant: Arc<TxnParticipant>,
    mvcc: Arc<MvccManager>,
    time_manager: Arc<TimeManager>,
}

impl ParticipantOp {
    /// Creates an op over the given collaborators.
    #[must_use]
    pub const fn new(
        state: ParticipantOpState,
        driver: DriverType,
        participant: Arc<TxnParticipant>,
        mvcc: Arc<MvccManager>,
        time_manager: Arc<TimeManager>,
    ) -> Self {
        Self {
            state,
            driver,
            participant,
            mvcc,
            time_manager,
        }
    }

    /// Returns the op state.
    #[must_use]
    pub const fn state(&self) -> &ParticipantOpState {
        &self.state
    }

    /// Builds the replicate message carrying this op's request.
    #[must_use]
    pub fn new_replicate_msg(&self) -> ReplicateMsg {
        ReplicateMsg::participant(self.state.request.clone())
    }

    /// Phase 1: acquire the transaction and validate the transition.
    ///
    /// On the leader, a `FINALIZE_COMMIT` also advances the clock so every
    /// timestamp assigned from here on is at or above the finalized commit
    /// timestamp.
    ///
    /// # Errors
    /// Returns the validation error; the response carries its description
    /// and the op must be finished with [`OpResult::Aborted`].
    pub fn prepare(&mut self) -> TxnResult<()> {
        debug!(op = %self.state, "prepare: starting");
        self.state.acquire_txn_and_lock(&self.participant);
        if let Err(e) = self.state.validate_op() {
            self.state.response.set_error(e.to_string());
            return Err(e);
        }

        if self.state.op_type() == ParticipantOpType::FinalizeCommit
            && self.driver == DriverType::Leader
        {
            let commit_timestamp = self
                .state
                .request
                .op
                .finalized_commit_timestamp
                .expect("validated above");
            self.time_manager
                .update_clock_and_last_assigned_timestamp(commit_timestamp);
        }
        debug!(op = %self.state, "prepare: finished");
        Ok(())
    }

    /// Phase 2: adopt the replicate message's consensus timestamp.
    ///
    /// For `BEGIN_COMMIT`, opens the MVCC op readers will wait on.
    pub fn start(&mut self, replicate_timestamp: Timestamp) {
        debug_assert!(self.state.timestamp.is_none(), "timestamp already assigned");
        self.state.timestamp = Some(replicate_timestamp);
        if self.state.op_type() == ParticipantOpType::BeginCommit {
            let mvcc_op = MvccManager::start_op(&self.mvcc, replicate_timestamp);
            self.state.set_mvcc_op(mvcc_op);
        }
        debug!(op = %self.state, "start");
    }

    /// Phase 3: run the transaction mutator and settle MVCC ownership.
    ///
    /// For `BEGIN_COMMIT`, the MVCC op moves from the op state into the
    /// transaction's commit-op slot, staying open until the commit is
    /// finalized or aborted.
    ///
    /// # Errors
    /// Returns an error only for an unknown op type; legal transitions were
    /// validated in Prepare.
    pub fn apply(&mut self, op_id: OpId) -> TxnResult<CommitMsg> {
        debug!(op = %self.state, "apply: starting");
        self.state.op_id = Some(op_id);
        if let Some(mvcc_op) = &self.state.begin_commit_mvcc_op {
            mvcc_op.start_applying();
        }
        let commit_msg = self.state.perform_op(op_id)?;
        if self.state.op_type() == ParticipantOpType::BeginCommit {
            self.state.release_mvcc_op_to_txn();
        }
        debug!(op = %self.state, "apply: finished");
        Ok(commit_msg)
    }

    /// Phase 4: release the transaction.
    ///
    /// An op that aborted before establishing transaction state clears the
    /// half-initialized transaction entry. An op abandoned after a
    /// successful Prepare (its round cancelled before applying) reports
    /// [`TxnError::Aborted`] on the response.
    pub fn finish(&mut self, result: OpResult) {
        let txn_id = self.state.txn_id();
        self.state.release_txn();
        if result == OpResult::Aborted {
            if !self.state.response.has_error() {
                let err = TxnError::aborted("operation aborted before applying");
                self.state.response.set_error(err.to_string());
            }
            self.participant.clear_if_init_failed(txn_id);
            debug!(op = %self.state, "finish: op aborted");
            return;
        }
        debug_assert_eq!(result, OpResult::Applied);
        debug!(op = %self.state, "finish: op applied");
    }
}

impl fmt::Display for ParticipantOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantOp [driver={:?}, state={}]", self.driver, self.state)
    }
}

#[cfg(test)]
mod tests {
    use slate_consensus::{OpType, TxnOpDescriptor};
    use slate_core::{LogIndex, TermId, TxnId};

    use super::*;
    use crate::mvcc::MvccOpPhase;
    use crate::txn::TxnState;

    fn op_id(term: u64, index: u64) -> OpId {
        OpId::new(TermId::new(term), LogIndex::new(index))
    }

    struct Harness {
        participant: Arc<TxnParticipant>,
        mvcc: Arc<MvccManager>,
        clock: Arc<TimeManager>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                participant: Arc::new(TxnParticipant::new()),
                mvcc: Arc::new(MvccManager::new()),
                clock: Arc::new(TimeManager::new()),
            }
        }

        fn make_op(&self, descriptor: TxnOpDescriptor, driver: DriverType) -> ParticipantOp {
            ParticipantOp::new(
                ParticipantOpState::new(ParticipantRequest::new(descriptor)),
                driver,
                Arc::clone(&self.participant),
                Arc::clone(&self.mvcc),
                Arc::clone(&self.clock),
            )
        }

        /// Drives one op through all four phases the way the op driver does.
        fn run(
            &self,
            descriptor: TxnOpDescriptor,
            driver: DriverType,
            replicate_ts: u64,
            id: OpId,
        ) -> TxnResult<CommitMsg> {
            let mut op = self.make_op(descriptor, driver);
            if let Err(e) = op.prepare() {
                op.finish(OpResult::Aborted);
                return Err(e);
            }
            op.start(Timestamp::new(replicate_ts));
            let commit_msg = op.apply(id)?;
            op.finish(OpResult::Applied);
            Ok(commit_msg)
        }

        fn txn_state(&self, txn_id: TxnId) -> Option<TxnState> {
            self.participant.get(txn_id).map(|txn| txn.state())
        }
    }

    const T: TxnId = TxnId::new(7);

    #[test]
    fn test_begin_txn_opens_transaction() {
        let harness = Harness::new();
        let commit_msg = harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();

        assert_eq!(commit_msg.op_type, OpType::Participant);
        assert_eq!(harness.txn_state(T), Some(TxnState::Open));
    }

    #[test]
    fn test_begin_txn_twice_fails_without_clearing() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();

        let err = harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                11,
                op_id(1, 2),
            )
            .unwrap_err();
        assert!(matches!(err, TxnError::IllegalTransition { .. }));
        // The established transaction is untouched.
        assert_eq!(harness.txn_state(T), Some(TxnState::Open));
    }

    #[test]
    fn test_begin_commit_parks_mvcc_op_in_txn() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginCommit),
                DriverType::Replica,
                100,
                op_id(1, 2),
            )
            .unwrap();

        assert_eq!(harness.txn_state(T), Some(TxnState::CommitInProgress));
        let txn = harness.participant.get(T).unwrap();
        assert!(txn.has_commit_op());
        // Readers at later timestamps wait on the op until finalize/abort.
        assert_eq!(
            harness.mvcc.op_phase(Timestamp::new(100)),
            Some(MvccOpPhase::Applying)
        );
        assert_eq!(harness.mvcc.num_active_ops(), 1);
    }

    #[test]
    fn test_finalize_commit_completes_mvcc_op() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginCommit),
                DriverType::Replica,
                100,
                op_id(1, 2),
            )
            .unwrap();

        harness
            .run(
                TxnOpDescriptor::finalize(T, Timestamp::new(105)),
                DriverType::Leader,
                106,
                op_id(1, 3),
            )
            .unwrap();

        assert_eq!(harness.txn_state(T), Some(TxnState::Committed));
        let txn = harness.participant.get(T).unwrap();
        assert!(!txn.has_commit_op());
        assert_eq!(
            harness.mvcc.op_phase(Timestamp::new(100)),
            Some(MvccOpPhase::Applied)
        );
        assert_eq!(harness.mvcc.num_active_ops(), 0);
        // The leader clock was advanced past the finalized timestamp.
        assert!(harness.clock.last_assigned_timestamp() >= Timestamp::new(105));
    }

    #[test]
    fn test_finalize_prepare_advances_leader_clock_only() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginCommit),
                DriverType::Replica,
                100,
                op_id(1, 2),
            )
            .unwrap();

        // A replica-side finalize leaves the clock alone.
        let mut replica_op = harness.make_op(
            TxnOpDescriptor::finalize(T, Timestamp::new(105)),
            DriverType::Replica,
        );
        replica_op.prepare().unwrap();
        assert!(harness.clock.last_assigned_timestamp() < Timestamp::new(105));
        replica_op.finish(OpResult::Aborted);

        // The leader-side finalize advances it during Prepare.
        let mut leader_op = harness.make_op(
            TxnOpDescriptor::finalize(T, Timestamp::new(105)),
            DriverType::Leader,
        );
        leader_op.prepare().unwrap();
        assert!(harness.clock.last_assigned_timestamp() >= Timestamp::new(105));
        leader_op.start(Timestamp::new(106));
        leader_op.apply(op_id(1, 3)).unwrap();
        leader_op.finish(OpResult::Applied);
    }

    #[test]
    fn test_abort_mid_commit_aborts_mvcc_op() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginCommit),
                DriverType::Replica,
                100,
                op_id(1, 2),
            )
            .unwrap();

        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::AbortTxn),
                DriverType::Replica,
                110,
                op_id(1, 3),
            )
            .unwrap();

        assert_eq!(harness.txn_state(T), Some(TxnState::Aborted));
        assert_eq!(
            harness.mvcc.op_phase(Timestamp::new(100)),
            Some(MvccOpPhase::Aborted)
        );

        // A finalize after the abort fails validation.
        let err = harness
            .run(
                TxnOpDescriptor::finalize(T, Timestamp::new(120)),
                DriverType::Leader,
                121,
                op_id(1, 4),
            )
            .unwrap_err();
        assert!(matches!(err, TxnError::IllegalTransition { .. }));
        assert_eq!(harness.txn_state(T), Some(TxnState::Aborted));
    }

    #[test]
    fn test_abort_of_unknown_txn_clears_entry() {
        let harness = Harness::new();
        let err = harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::AbortTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap_err();
        assert!(matches!(err, TxnError::IllegalTransition { .. }));
        // The half-initialized entry was cleared in Finish.
        assert!(harness.participant.get(T).is_none());
    }

    #[test]
    fn test_failed_prepare_does_not_advance_state() {
        let harness = Harness::new();
        harness
            .run(
                TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
                DriverType::Replica,
                10,
                op_id(1, 1),
            )
            .unwrap();

        // FINALIZE_COMMIT from OPEN is illegal.
        let err = harness
            .run(
                TxnOpDescriptor::finalize(T, Timestamp::new(50)),
                DriverType::Leader,
                51,
                op_id(1, 2),
            )
            .unwrap_err();
        assert!(matches!(err, TxnError::IllegalTransition { .. }));
        assert_eq!(harness.txn_state(T), Some(TxnState::Open));
    }

    #[test]
    fn test_abort_after_successful_prepare_reports_aborted() {
        let harness = Harness::new();
        // Prepare succeeds, then the round is abandoned before applying
        // (the shutdown-cancellation path).
        let mut op = harness.make_op(
            TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
            DriverType::Leader,
        );
        op.prepare().unwrap();
        assert!(!op.state().response().has_error());

        op.finish(OpResult::Aborted);
        let error = op.state().response().error.as_deref().unwrap();
        assert!(error.contains("aborted"));
        // The never-begun transaction entry was cleared.
        assert!(harness.participant.get(T).is_none());
    }

    #[test]
    fn test_finalize_without_timestamp_rejected() {
        let harness = Harness::new();
        let mut op = harness.make_op(
            TxnOpDescriptor::new(T, ParticipantOpType::FinalizeCommit),
            DriverType::Leader,
        );
        let err = op.prepare().unwrap_err();
        assert!(matches!(err, TxnError::InvalidArgument { .. }));
        assert!(op.state().response().has_error());
        op.finish(OpResult::Aborted);
    }

    #[test]
    fn test_unknown_op_type_rejected() {
        let harness = Harness::new();
        let mut op = harness.make_op(
            TxnOpDescriptor::new(T, ParticipantOpType::Unknown),
            DriverType::Replica,
        );
        let err = op.prepare().unwrap_err();
        assert!(matches!(err, TxnError::InvalidArgument { .. }));
        op.finish(OpResult::Aborted);
        assert!(harness.participant.get(T).is_none());
    }

    #[test]
    fn test_finalize_replay_without_commit_op_is_mvcc_noop() {
        let harness = Harness::new();
        // Simulate bootstrap replay: the transaction reached
        // COMMIT_IN_PROGRESS in a previous incarnation whose BEGIN_COMMIT
        // mvcc op was already fully applied (so no commit op is held).
        {
            let txn = harness.participant.get_or_create(T);
            let mut guard = txn.acquire_write_lock();
            guard.begin(op_id(1, 1));
            guard.begin_commit(op_id(1, 2));
        }

        harness
            .run(
                TxnOpDescriptor::finalize(T, Timestamp::new(105)),
                DriverType::Replica,
                106,
                op_id(1, 3),
            )
            .unwrap();

        assert_eq!(harness.txn_state(T), Some(TxnState::Committed));
        assert_eq!(harness.mvcc.num_active_ops(), 0);
    }

    #[test]
    fn test_new_replicate_msg_carries_request() {
        let harness = Harness::new();
        let op = harness.make_op(
            TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
            DriverType::Leader,
        );
        let msg = op.new_replicate_msg();
        assert_eq!(msg.op_type, OpType::Participant);
        assert!(!msg.has_id());
        assert_eq!(
            msg.participant_request.unwrap().op.txn_id,
            T
        );
    }

    #[test]
    fn test_display_names_type_and_timestamps() {
        let harness = Harness::new();
        let mut op = harness.make_op(
            TxnOpDescriptor::new(T, ParticipantOpType::BeginTxn),
            DriverType::Replica,
        );
        assert!(op.state().to_string().contains("type=BEGIN_TXN"));
        assert!(op.state().to_string().contains("ts=<unassigned>"));
        op.prepare().unwrap();
        op.start(Timestamp::new(42));
        assert!(op.state().to_string().contains("ts=ts-42"));
        op.apply(op_id(1, 1)).unwrap();
        op.finish(OpResult::Applied);

        let debugged = format!("{:?}", op.state());
        assert!(debugged.contains("BEGIN_TXN"));
        assert!(debugged.contains("txn(7)"));
        assert!(debugged.contains("ts(42)"));
    }
}
