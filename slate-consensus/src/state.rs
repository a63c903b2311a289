//! The central per-replica consensus state container.
//!
//! [`ReplicaState`] is the single serialization point for everything one
//! tablet replica knows about consensus: lifecycle, term and vote, quorum
//! membership (committed and pending), the pending-operation map, and the
//! received / replicated / committed watermarks. Every external mutator
//! acquires the state lock through a typed entry point that validates the
//! lifecycle and role preconditions before handing out the guard.
//!
//! Durable metadata (term, vote, committed quorum) is flushed through the
//! [`ConsensusMetadata`] before a mutation becomes observable; a failed
//! flush leaves the in-memory state unchanged.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use slate_core::limits::PENDING_OPS_MAX;
use slate_core::{CallbackPool, CountdownLatch, LogIndex, PeerId, TabletId, TermId};
use tracing::{debug, info};

use crate::error::{ConsensusError, ConsensusResult};
use crate::message::{OpType, ReplicateMsg};
use crate::metadata::ConsensusMetadata;
use crate::opid::OpId;
use crate::quorum::{PeerRole, Quorum, QuorumSnapshot};
use crate::watchers::{MarkMode, OpCallback, OpIdWatcherSet};

/// Static configuration of one replica.
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    /// The tablet this replica serves.
    pub tablet_id: TabletId,
}

/// Lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed; consensus not yet started.
    Initialized,
    /// Serving: admitting, replicating, and committing operations.
    Running,
    /// A configuration change is being applied.
    ChangingConfig,
    /// Draining in-flight applies before terminating.
    ShuttingDown,
    /// Terminal.
    ShutDown,
}

impl Lifecycle {
    /// Returns the state's name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::ChangingConfig => "CHANGING_CONFIG",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ShutDown => "SHUT_DOWN",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pending operation's apply is triggered once consensus commits it.
enum CommitHandler {
    /// Invoke the driver's continuation directly under the state lock.
    Direct(Arc<dyn CommitContinuation>),
    /// Submit the completion callback to the callback pool.
    ///
    /// Taken when the apply is dispatched; `None` afterwards.
    Pooled(Option<OpCallback>),
}

/// Continuation owned by an operation driver, invoked when consensus
/// commits the operation (or when the replica aborts it during shutdown).
pub trait CommitContinuation: Send + Sync {
    /// Called under the state lock when the operation's apply is triggered.
    ///
    /// # Errors
    /// Returns an error if the apply cannot be started; the error is
    /// propagated to the consensus driver.
    fn consensus_committed(&self) -> ConsensusResult<()>;

    /// Called when the operation is abandoned before its apply started.
    fn abort(&self);
}

/// One operation admitted into the pending map.
///
/// Created on admission, removed on commit completion or cancellation.
pub struct PendingOp {
    /// The operation's log position.
    pub id: OpId,
    /// The replicate message being driven through consensus.
    pub msg: ReplicateMsg,
    handler: CommitHandler,
}

impl PendingOp {
    /// Creates a pending operation whose apply is driven by a continuation.
    ///
    /// # Panics
    /// Panics if the message has no assigned id.
    #[must_use]
    pub fn with_continuation(msg: ReplicateMsg, continuation: Arc<dyn CommitContinuation>) -> Self {
        let id = msg.id.expect("pending op requires a stamped message");
        Self {
            id,
            msg,
            handler: CommitHandler::Direct(continuation),
        }
    }

    /// Creates a pending operation completed through the callback pool.
    ///
    /// # Panics
    /// Panics if the message has no assigned id.
    #[must_use]
    pub fn with_callback(msg: ReplicateMsg, callback: OpCallback) -> Self {
        let id = msg.id.expect("pending op requires a stamped message");
        Self {
            id,
            msg,
            handler: CommitHandler::Pooled(Some(callback)),
        }
    }
}

struct ReplicaStateInner {
    lifecycle: Lifecycle,
    cmeta: ConsensusMetadata,
    snapshot: QuorumSnapshot,
    pending_quorum: Option<Quorum>,
    next_index: LogIndex,
    pending_ops: BTreeMap<OpId, PendingOp>,
    in_flight_commits: HashSet<OpId>,
    received_op_id: OpId,
    replicated_op_id: OpId,
    last_triggered_apply: OpId,
    replicate_watchers: OpIdWatcherSet,
    commit_watchers: OpIdWatcherSet,
    drain_latch: Arc<CountdownLatch>,
}

/// The authoritative consensus state of one tablet replica.
///
/// All mutations happen under a single exclusive lock, acquired through the
/// typed `lock_for_*` entry points. The guard they return exposes the
/// individual state operations.
pub struct ReplicaState {
    options: ConsensusOptions,
    peer_uuid: PeerId,
    pool: Arc<CallbackPool>,
    inner: Mutex<ReplicaStateInner>,
}

impl ReplicaState {
    /// Creates a replica state around the given durable metadata.
    ///
    /// The acting quorum snapshot is seeded from the committed quorum in the
    /// metadata; the replica starts in [`Lifecycle::Initialized`].
    #[must_use]
    pub fn new(
        options: ConsensusOptions,
        peer_uuid: PeerId,
        cmeta: ConsensusMetadata,
        pool: Arc<CallbackPool>,
    ) -> Self {
        let snapshot = QuorumSnapshot::build(&cmeta.record().committed_quorum, &peer_uuid);
        let inner = ReplicaStateInner {
            lifecycle: Lifecycle::Initialized,
            cmeta,
            snapshot,
            pending_quorum: None,
            next_index: LogIndex::new(0),
            pending_ops: BTreeMap::new(),
            in_flight_commits: HashSet::new(),
            received_op_id: OpId::MIN,
            replicated_op_id: OpId::MIN,
            last_triggered_apply: OpId::MIN,
            replicate_watchers: OpIdWatcherSet::new(Arc::clone(&pool)),
            commit_watchers: OpIdWatcherSet::new(Arc::clone(&pool)),
            drain_latch: Arc::new(CountdownLatch::new(0)),
        };
        Self {
            options,
            peer_uuid,
            pool,
            inner: Mutex::new(inner),
        }
    }

    /// Returns this replica's permanent UUID.
    #[must_use]
    pub const fn peer_uuid(&self) -> &PeerId {
        &self.peer_uuid
    }

    /// Returns the replica's static configuration.
    #[must_use]
    pub const fn options(&self) -> &ConsensusOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, ReplicaStateInner> {
        self.inner.lock().expect("replica state lock poisoned")
    }

    /// Acquires the lock for starting consensus.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is `INITIALIZED`.
    pub fn lock_for_start(&self) -> ConsensusResult<StateGuard<'_>> {
        let inner = self.lock();
        if inner.lifecycle != Lifecycle::Initialized {
            return Err(ConsensusError::illegal_state(format!(
                "cannot start: replica is in state {}",
                inner.lifecycle
            )));
        }
        Ok(StateGuard { state: self, inner })
    }

    /// Acquires the lock for reading. Never fails.
    #[must_use]
    pub fn lock_for_read(&self) -> StateGuard<'_> {
        StateGuard {
            state: self,
            inner: self.lock(),
        }
    }

    /// Acquires the lock for admitting a replicate message.
    ///
    /// Only the leader may replicate; a candidate may push a config-change
    /// round in the bootstrap term only.
    ///
    /// # Errors
    /// Returns `IllegalState` if the replica is not running, or if its role
    /// does not permit replicating this message.
    pub fn lock_for_replicate(&self, msg: &ReplicateMsg) -> ConsensusResult<StateGuard<'_>> {
        debug_assert!(!msg.has_id(), "message should not have an id yet");
        let inner = self.lock();
        if inner.lifecycle != Lifecycle::Running {
            return Err(ConsensusError::illegal_state(
                "replica not in running state",
            ));
        }
        match inner.snapshot.self_role {
            PeerRole::Leader => Ok(StateGuard { state: self, inner }),
            PeerRole::Candidate => {
                if msg.op_type != OpType::ChangeConfig {
                    return Err(ConsensusError::illegal_state(
                        "only a config change round can be pushed while candidate",
                    ));
                }
                // Bootstrap only: the first candidate/leader of the quorum.
                assert_eq!(
                    inner.cmeta.record().current_term,
                    TermId::new(0),
                    "candidate replicate outside the bootstrap term"
                );
                Ok(StateGuard { state: self, inner })
            }
            role => Err(ConsensusError::illegal_state(format!(
                "replica {} is not leader of this quorum, role: {role}",
                self.peer_uuid
            ))),
        }
    }

    /// Acquires the lock for commit processing.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is running or shutting down.
    pub fn lock_for_commit(&self) -> ConsensusResult<StateGuard<'_>> {
        let inner = self.lock();
        if inner.lifecycle != Lifecycle::Running && inner.lifecycle != Lifecycle::ShuttingDown {
            return Err(ConsensusError::illegal_state(
                "replica not in running state",
            ));
        }
        Ok(StateGuard { state: self, inner })
    }

    /// Acquires the lock for a configuration change, transitioning to
    /// `CHANGING_CONFIG`.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is `INITIALIZED` or
    /// `RUNNING`.
    pub fn lock_for_config_change(&self) -> ConsensusResult<StateGuard<'_>> {
        let mut inner = self.lock();
        if inner.lifecycle != Lifecycle::Initialized && inner.lifecycle != Lifecycle::Running {
            return Err(ConsensusError::illegal_state(format!(
                "cannot change config in state {}",
                inner.lifecycle
            )));
        }
        inner.lifecycle = Lifecycle::ChangingConfig;
        Ok(StateGuard { state: self, inner })
    }

    /// Acquires the lock for an election-driven mutation (term, vote).
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is `INITIALIZED` or
    /// `RUNNING`.
    pub fn lock_for_election(&self) -> ConsensusResult<StateGuard<'_>> {
        let inner = self.lock();
        if inner.lifecycle != Lifecycle::Initialized && inner.lifecycle != Lifecycle::Running {
            return Err(ConsensusError::illegal_state(format!(
                "unexpected replica state for election: {}",
                inner.lifecycle
            )));
        }
        Ok(StateGuard { state: self, inner })
    }

    /// Acquires the lock for applying a leader's update.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is running and is a
    /// non-leader participant of the quorum.
    pub fn lock_for_update(&self) -> ConsensusResult<StateGuard<'_>> {
        let inner = self.lock();
        if inner.lifecycle != Lifecycle::Running {
            return Err(ConsensusError::illegal_state(
                "replica not in running state",
            ));
        }
        match inner.snapshot.self_role {
            PeerRole::Leader => Err(ConsensusError::illegal_state(
                "replica is leader of the quorum",
            )),
            PeerRole::NonParticipant => Err(ConsensusError::illegal_state(
                "replica is not a participant of this quorum",
            )),
            _ => Ok(StateGuard { state: self, inner }),
        }
    }

    /// Acquires the lock for shutdown, transitioning to `SHUTTING_DOWN`.
    ///
    /// Idempotent while shutting down. The first transition arms the drain
    /// latch with the number of in-flight commits.
    ///
    /// # Errors
    /// Returns `IllegalState` if the replica is already shut down.
    pub fn lock_for_shutdown(&self) -> ConsensusResult<StateGuard<'_>> {
        let mut inner = self.lock();
        if inner.lifecycle == Lifecycle::ShutDown {
            return Err(ConsensusError::illegal_state("replica is already shutdown"));
        }
        if inner.lifecycle != Lifecycle::ShuttingDown {
            inner.lifecycle = Lifecycle::ShuttingDown;
            inner.drain_latch.reset(inner.in_flight_commits.len() as u64);
        }
        Ok(StateGuard { state: self, inner })
    }

    /// Completes shutdown, transitioning to the terminal `SHUT_DOWN` state.
    ///
    /// # Panics
    /// Panics unless the replica is `SHUTTING_DOWN`; calling this without a
    /// prior [`Self::lock_for_shutdown`] is a driver bug.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        assert_eq!(
            inner.lifecycle,
            Lifecycle::ShuttingDown,
            "shutdown without entering SHUTTING_DOWN first"
        );
        inner.lifecycle = Lifecycle::ShutDown;
        info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            "replica shut down"
        );
    }

    /// Aborts every pending operation whose apply has not yet been
    /// triggered. Operations already in flight are left to complete.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is `SHUTTING_DOWN`.
    pub fn cancel_pending_transactions(&self) -> ConsensusResult<()> {
        let mut inner = self.lock();
        if inner.lifecycle != Lifecycle::ShuttingDown {
            return Err(ConsensusError::illegal_state(
                "can only cancel pending operations while shutting down",
            ));
        }
        info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            pending = inner.pending_ops.len(),
            "aborting pending operations"
        );
        let inner = &mut *inner;
        for (id, op) in &mut inner.pending_ops {
            if inner.in_flight_commits.contains(id) {
                debug!(op_id = %id, "skipping abort: apply already in flight");
                continue;
            }
            match &mut op.handler {
                CommitHandler::Direct(continuation) => continuation.abort(),
                CommitHandler::Pooled(callback) => {
                    if let Some(callback) = callback.take() {
                        self.pool.submit(move || {
                            callback(Err(ConsensusError::aborted(
                                "operation aborted: replica shutting down",
                            )));
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Blocks until every apply that was in flight when shutdown began has
    /// completed.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the replica is `SHUTTING_DOWN`.
    pub fn wait_for_outstanding_applies(&self) -> ConsensusResult<()> {
        let latch = {
            let inner = self.lock();
            if inner.lifecycle != Lifecycle::ShuttingDown {
                return Err(ConsensusError::illegal_state(
                    "can only wait for applies while shutting down",
                ));
            }
            info!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                outstanding = inner.drain_latch.count(),
                "waiting on outstanding applies"
            );
            Arc::clone(&inner.drain_latch)
        };
        latch.wait();
        info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            "all local commits completed"
        );
        Ok(())
    }

    /// Registers a callback to fire once the replicated watermark reaches
    /// `op_id`.
    ///
    /// # Errors
    /// Returns `AlreadyPresent` if the operation has already been
    /// replicated.
    pub fn register_on_replicated(
        &self,
        op_id: OpId,
        callback: OpCallback,
    ) -> ConsensusResult<()> {
        let mut inner = self.lock();
        if op_id > inner.replicated_op_id {
            inner.replicate_watchers.register(op_id, callback);
            return Ok(());
        }
        Err(ConsensusError::already_present(
            "the operation has already been replicated",
        ))
    }

    /// Registers a callback to fire once the apply for `op_id` completes.
    ///
    /// # Errors
    /// Returns `AlreadyPresent` if the operation has already been committed.
    pub fn register_on_commit(&self, op_id: OpId, callback: OpCallback) -> ConsensusResult<()> {
        let mut inner = self.lock();
        if op_id > inner.replicated_op_id || inner.pending_ops.contains_key(&op_id) {
            inner.commit_watchers.register(op_id, callback);
            return Ok(());
        }
        Err(ConsensusError::already_present(
            "the operation has already been committed",
        ))
    }
}

/// The held state lock, exposing the individual state operations.
///
/// Obtained through one of the `lock_for_*` entry points on
/// [`ReplicaState`]; dropped to release the lock.
pub struct StateGuard<'a> {
    state: &'a ReplicaState,
    inner: MutexGuard<'a, ReplicaStateInner>,
}

impl StateGuard<'_> {
    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle
    }

    /// Starts consensus from the given initial operation id, seeding the
    /// watermarks and the next index, and transitions to `RUNNING`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `initial_id` belongs to an older term
    /// than the durable current term.
    ///
    /// # Panics
    /// Panics if `initial_id` belongs to a *newer* term: the caller must
    /// have advanced the durable term before starting.
    pub fn start(&mut self, initial_id: OpId) -> ConsensusResult<()> {
        let current_term = self.inner.cmeta.record().current_term;
        if initial_id.term < current_term {
            return Err(ConsensusError::invalid_argument(format!(
                "cannot start in older term, current: {current_term}, passed: {}",
                initial_id.term
            )));
        }
        assert_eq!(
            initial_id.term, current_term,
            "starting with term {} greater than last recorded term {current_term}",
            initial_id.term
        );

        self.inner.next_index = initial_id.index.next();
        self.inner.received_op_id = initial_id;
        self.inner.replicated_op_id = initial_id;
        self.inner.last_triggered_apply = initial_id;
        self.inner.lifecycle = Lifecycle::Running;
        info!(
            tablet = %self.state.options.tablet_id,
            peer = %self.state.peer_uuid,
            initial_id = %initial_id,
            "consensus started"
        );
        Ok(())
    }

    /// Completes a configuration change, transitioning back to `RUNNING`.
    ///
    /// # Panics
    /// Panics unless the replica is `CHANGING_CONFIG`.
    pub fn config_done(&mut self) {
        assert_eq!(
            self.inner.lifecycle,
            Lifecycle::ChangingConfig,
            "config_done outside a config change"
        );
        self.inner.lifecycle = Lifecycle::Running;
    }

    // ---------------------------------------------------------------------
    // Quorum membership
    // ---------------------------------------------------------------------

    /// Returns the acting quorum snapshot.
    #[must_use]
    pub fn quorum_snapshot(&self) -> &QuorumSnapshot {
        &self.inner.snapshot
    }

    /// Returns true if a quorum change is pending.
    #[must_use]
    pub fn is_quorum_change_pending(&self) -> bool {
        self.inner.pending_quorum.is_some()
    }

    /// Stages a new quorum and rebuilds the acting snapshot from it, so
    /// role-dependent admission sees the new role at once. The committed
    /// quorum is unchanged until [`Self::set_committed_quorum`].
    ///
    /// # Panics
    /// Panics if another quorum change is already pending.
    pub fn set_pending_quorum(&mut self, new_quorum: Quorum) {
        assert!(
            self.inner.pending_quorum.is_none(),
            "quorum change already pending: {}",
            self.inner.pending_quorum.as_ref().map_or_else(String::new, ToString::to_string)
        );
        self.inner.snapshot = QuorumSnapshot::build(&new_quorum, &self.state.peer_uuid);
        self.inner.pending_quorum = Some(new_quorum);
    }

    /// Returns the pending quorum.
    ///
    /// # Panics
    /// Panics if no quorum change is pending.
    #[must_use]
    pub fn pending_quorum(&self) -> &Quorum {
        self.inner
            .pending_quorum
            .as_ref()
            .expect("no pending quorum")
    }

    /// Durably installs `new_quorum` as the committed quorum and clears the
    /// pending slot.
    ///
    /// If a change is pending, `new_quorum` must be byte-equal to it.
    ///
    /// # Errors
    /// Returns an error if the metadata flush fails; all in-memory state is
    /// then unchanged.
    ///
    /// # Panics
    /// Panics if a different quorum change is pending.
    pub fn set_committed_quorum(&mut self, new_quorum: Quorum) -> ConsensusResult<()> {
        let was_pending = match &self.inner.pending_quorum {
            Some(pending) => {
                assert_eq!(
                    pending.encoded(),
                    new_quorum.encoded(),
                    "attempting to persist a quorum change while a different one is pending: \
                     pending: {pending}, new: {new_quorum}"
                );
                true
            }
            None => false,
        };

        let mut staged = self.inner.cmeta.record().clone();
        staged.committed_quorum = new_quorum.clone();
        self.inner.cmeta.update(staged)?;

        if !was_pending {
            // Net-new quorum: refresh the acting snapshot.
            self.inner.snapshot = QuorumSnapshot::build(&new_quorum, &self.state.peer_uuid);
        }
        self.inner.pending_quorum = None;
        Ok(())
    }

    /// Returns the durably committed quorum.
    #[must_use]
    pub fn committed_quorum(&self) -> &Quorum {
        &self.inner.cmeta.record().committed_quorum
    }

    /// Increments the committed quorum's sequence number and flushes.
    ///
    /// # Errors
    /// Returns an error if the metadata flush fails.
    pub fn increment_config_seqno(&mut self) -> ConsensusResult<()> {
        let mut staged = self.inner.cmeta.record().clone();
        staged.committed_quorum.seqno += 1;
        self.inner.cmeta.update(staged)?;
        self.inner.snapshot = QuorumSnapshot::build(
            &self.inner.cmeta.record().committed_quorum,
            &self.state.peer_uuid,
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Term and vote
    // ---------------------------------------------------------------------

    /// Returns the durable current term.
    #[must_use]
    pub fn current_term(&self) -> TermId {
        self.inner.cmeta.record().current_term
    }

    /// Durably sets the current term.
    ///
    /// Advancing to a strictly greater term clears the vote record.
    ///
    /// # Errors
    /// Returns `IllegalState` if `new_term` is lower than the current term,
    /// or the flush error if persistence fails; in both cases the in-memory
    /// state is unchanged.
    pub fn set_current_term(&mut self, new_term: TermId) -> ConsensusResult<()> {
        let current = self.inner.cmeta.record().current_term;
        if new_term < current {
            return Err(ConsensusError::illegal_state(format!(
                "cannot change term to a lower one, current: {current}, proposed: {new_term}"
            )));
        }
        let mut staged = self.inner.cmeta.record().clone();
        staged.current_term = new_term;
        if new_term > current {
            staged.voted_for = None;
        }
        self.inner.cmeta.update(staged)?;
        Ok(())
    }

    /// Durably advances the term by one, clearing the vote record.
    ///
    /// # Errors
    /// Returns the flush error if persistence fails.
    pub fn increment_term(&mut self) -> ConsensusResult<()> {
        let next = TermId::new(self.inner.cmeta.record().current_term.get() + 1);
        self.set_current_term(next)
    }

    /// Returns true if a vote has been cast in the current term.
    #[must_use]
    pub fn has_voted_current_term(&self) -> bool {
        self.inner.cmeta.record().voted_for.is_some()
    }

    /// Returns the peer voted for in the current term, if any.
    #[must_use]
    pub fn voted_for_current_term(&self) -> Option<&PeerId> {
        self.inner.cmeta.record().voted_for.as_ref()
    }

    /// Durably records a vote for the given peer in the current term.
    ///
    /// # Errors
    /// Returns the flush error if persistence fails; the vote is then not
    /// considered cast.
    pub fn set_voted_for(&mut self, uuid: PeerId) -> ConsensusResult<()> {
        let mut staged = self.inner.cmeta.record().clone();
        staged.voted_for = Some(uuid);
        self.inner.cmeta.update(staged)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pending operations and watermarks
    // ---------------------------------------------------------------------

    /// Assigns the next operation id `(current_term, next_index)`.
    ///
    /// Used by the leader to stamp outgoing replicate messages.
    pub fn new_id(&mut self) -> OpId {
        let id = OpId::new(self.inner.cmeta.record().current_term, self.inner.next_index);
        self.inner.next_index = self.inner.next_index.next();
        id
    }

    /// Rescinds the most recently assigned operation id and removes its
    /// pending entry.
    ///
    /// # Panics
    /// Panics if `id` is not the most recently assigned id in the current
    /// term; out-of-order cancellation is not supported.
    pub fn cancel_pending(&mut self, id: OpId) {
        assert_eq!(
            self.inner.cmeta.record().current_term,
            id.term,
            "cancelling an op from another term"
        );
        assert_eq!(
            self.inner.next_index,
            id.index.next(),
            "only the most recently assigned id may be cancelled"
        );
        self.inner.next_index = id.index;
        let removed = self.inner.pending_ops.remove(&id);
        debug_assert!(removed.is_some(), "cancelled op {id} was not pending");
    }

    /// Admits an operation into the pending map.
    ///
    /// Outside `RUNNING`, only config-change operations are admitted.
    ///
    /// # Errors
    /// Returns `IllegalState` if the replica cannot admit the operation.
    ///
    /// # Panics
    /// Panics on a duplicate id or if the pending map is full.
    pub fn add_pending(&mut self, op: PendingOp) -> ConsensusResult<()> {
        if self.inner.lifecycle != Lifecycle::Running && op.msg.op_type != OpType::ChangeConfig {
            return Err(ConsensusError::illegal_state(
                "cannot trigger prepare: replica is not in running state",
            ));
        }
        assert!(
            self.inner.pending_ops.len() < PENDING_OPS_MAX,
            "pending operation map is full ({PENDING_OPS_MAX})"
        );
        let id = op.id;
        let previous = self.inner.pending_ops.insert(id, op);
        assert!(previous.is_none(), "duplicate pending op {id}");
        Ok(())
    }

    /// Returns the number of pending operations.
    #[must_use]
    pub fn num_pending_ops(&self) -> usize {
        self.inner.pending_ops.len()
    }

    /// Returns the number of applies currently in flight.
    #[must_use]
    pub fn num_in_flight_commits(&self) -> usize {
        self.inner.in_flight_commits.len()
    }

    /// Declaratively advances the commit watermark to `id`, dispatching the
    /// apply of every pending operation up to and including it, in id order.
    ///
    /// A watermark at or below the current one is tolerated as a no-op:
    /// concurrent consensus updates may be reordered in the RPC queue.
    ///
    /// # Errors
    /// Returns `ServiceUnavailable` while shutting down, `IllegalState`
    /// outside `RUNNING`, or a continuation error from a triggered apply.
    pub fn mark_consensus_committed_up_to(&mut self, id: OpId) -> ConsensusResult<()> {
        match self.inner.lifecycle {
            Lifecycle::ShuttingDown | Lifecycle::ShutDown => {
                return Err(ConsensusError::unavailable(
                    "cannot trigger apply: replica is shutting down",
                ));
            }
            Lifecycle::Running => {}
            _ => {
                return Err(ConsensusError::illegal_state(
                    "cannot trigger apply: replica is not in running state",
                ));
            }
        }

        if self.inner.last_triggered_apply >= id {
            debug!(
                tablet = %self.state.options.tablet_id,
                peer = %self.state.peer_uuid,
                marked = %self.inner.last_triggered_apply,
                requested = %id,
                "apply watermark already past requested id"
            );
            return Ok(());
        }

        let inner = &mut *self.inner;
        let range = (
            Bound::Excluded(inner.last_triggered_apply),
            Bound::Included(id),
        );
        for (op_id, op) in inner.pending_ops.range_mut(range) {
            let inserted = inner.in_flight_commits.insert(*op_id);
            assert!(inserted, "op {op_id} already in flight");

            match &mut op.handler {
                CommitHandler::Direct(continuation) => continuation.consensus_committed()?,
                CommitHandler::Pooled(callback) => {
                    let callback = callback
                        .take()
                        .expect("pooled commit callback already taken");
                    self.state.pool.submit(move || callback(Ok(())));
                }
            }
        }
        inner.last_triggered_apply = id;
        Ok(())
    }

    /// Records that the apply for `op_id` completed, removing it from the
    /// pending map and the in-flight set and firing its commit watchers.
    ///
    /// While shutting down, also decrements the drain latch.
    ///
    /// # Panics
    /// Panics if the operation is not in flight or not pending; that
    /// indicates a driver bug.
    pub fn update_committed_op_id(&mut self, op_id: OpId) {
        assert!(
            self.inner.in_flight_commits.remove(&op_id),
            "op {op_id} was not in the in-flight set"
        );
        assert!(
            self.inner.pending_ops.remove(&op_id).is_some(),
            "op {op_id} was not in the pending set"
        );
        self.inner
            .commit_watchers
            .mark_finished(op_id, MarkMode::OnlyThisOp);
        if self.inner.lifecycle == Lifecycle::ShuttingDown {
            self.inner.drain_latch.count_down();
        }
    }

    /// Advances the replicated watermark, firing replicate watchers for all
    /// operations at or below `op_id`.
    pub fn update_last_replicated_op_id(&mut self, op_id: OpId) {
        debug_assert!(
            op_id >= self.inner.replicated_op_id,
            "replicated watermark moving backwards: {} -> {op_id}",
            self.inner.replicated_op_id
        );
        self.inner.replicated_op_id = op_id;
        self.inner
            .replicate_watchers
            .mark_finished(op_id, MarkMode::AllOpsBefore);
    }

    /// Advances the received watermark and the next index.
    pub fn update_last_received_op_id(&mut self, op_id: OpId) {
        debug_assert!(
            self.inner.received_op_id <= op_id,
            "received watermark moving backwards: {} -> {op_id}",
            self.inner.received_op_id
        );
        self.inner.received_op_id = op_id;
        self.inner.next_index = op_id.index.next();
    }

    /// Returns the commit watermark (highest op whose apply was dispatched).
    #[must_use]
    pub fn last_committed_op_id(&self) -> OpId {
        self.inner.last_triggered_apply
    }

    /// Returns the replicated watermark.
    #[must_use]
    pub fn last_replicated_op_id(&self) -> OpId {
        self.inner.replicated_op_id
    }

    /// Returns the received watermark.
    #[must_use]
    pub fn last_received_op_id(&self) -> OpId {
        self.inner.received_op_id
    }
}

impl fmt::Display for StateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Replica: {}, State: {}, Role: {}",
            self.state.peer_uuid, self.inner.lifecycle, self.inner.snapshot.self_role
        )?;
        writeln!(
            f,
            "Watermarks: {{Received: {} Replicated: {} Committed: {}}}",
            self.inner.received_op_id, self.inner.replicated_op_id, self.inner.last_triggered_apply
        )?;
        write!(
            f,
            "Num. outstanding commits: {}",
            self.inner.in_flight_commits.len()
        )
    }
}
