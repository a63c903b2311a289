//! Replicated log message types.
//!
//! A [`ReplicateMsg`] is the payload the leader stamps with an [`OpId`] and
//! pushes through consensus; a [`CommitMsg`] records locally that the
//! corresponding apply completed. Transport encoding is owned by the RPC
//! layer; these are the in-process forms.

use bytes::Bytes;
use slate_core::{Timestamp, TxnId};

use crate::opid::OpId;
use crate::quorum::Quorum;

/// Type of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// A tablet write batch.
    Write,
    /// A quorum membership change.
    ChangeConfig,
    /// A transaction participant state transition.
    Participant,
}

impl OpType {
    /// Returns the type's name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "WRITE_OP",
            Self::ChangeConfig => "CHANGE_CONFIG_OP",
            Self::Participant => "PARTICIPANT_OP",
        }
    }
}

/// Type of a transaction participant operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantOpType {
    /// Open the transaction on this participant.
    BeginTxn,
    /// Start committing: open the MVCC window readers wait on.
    BeginCommit,
    /// Make the commit visible at the coordinator-chosen timestamp.
    FinalizeCommit,
    /// Abort the transaction.
    AbortTxn,
    /// Unrecognized; always rejected.
    Unknown,
}

impl ParticipantOpType {
    /// Returns the type's name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeginTxn => "BEGIN_TXN",
            Self::BeginCommit => "BEGIN_COMMIT",
            Self::FinalizeCommit => "FINALIZE_COMMIT",
            Self::AbortTxn => "ABORT_TXN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Describes one participant operation within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOpDescriptor {
    /// The transaction this operation belongs to.
    pub txn_id: TxnId,
    /// Which transition to drive.
    pub op_type: ParticipantOpType,
    /// The coordinator-chosen commit timestamp; required for
    /// [`ParticipantOpType::FinalizeCommit`], absent otherwise.
    pub finalized_commit_timestamp: Option<Timestamp>,
}

impl TxnOpDescriptor {
    /// Creates a descriptor without a finalized commit timestamp.
    #[must_use]
    pub const fn new(txn_id: TxnId, op_type: ParticipantOpType) -> Self {
        Self {
            txn_id,
            op_type,
            finalized_commit_timestamp: None,
        }
    }

    /// Creates a `FINALIZE_COMMIT` descriptor carrying the commit timestamp.
    #[must_use]
    pub const fn finalize(txn_id: TxnId, commit_timestamp: Timestamp) -> Self {
        Self {
            txn_id,
            op_type: ParticipantOpType::FinalizeCommit,
            finalized_commit_timestamp: Some(commit_timestamp),
        }
    }
}

/// Request payload of a participant operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRequest {
    /// The operation to perform.
    pub op: TxnOpDescriptor,
}

impl ParticipantRequest {
    /// Creates a request for the given operation.
    #[must_use]
    pub const fn new(op: TxnOpDescriptor) -> Self {
        Self { op }
    }
}

/// Response echoed back to the participant op submitter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantResponse {
    /// Error description, set when the operation was rejected or aborted.
    pub error: Option<String>,
}

impl ParticipantResponse {
    /// Records an error on the response.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Returns true if an error was recorded.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A message to be replicated through consensus.
///
/// Created without an id; the leader assigns one via the replica state's
/// `new_id` before handing the message to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateMsg {
    /// Operation type.
    pub op_type: OpType,
    /// Log position, assigned by the leader on admission.
    pub id: Option<OpId>,
    /// Consensus timestamp, assigned when the message is stamped.
    pub timestamp: Option<Timestamp>,
    /// Write payload (for [`OpType::Write`]).
    pub payload: Bytes,
    /// New quorum (for [`OpType::ChangeConfig`]).
    pub new_quorum: Option<Quorum>,
    /// Participant request (for [`OpType::Participant`]).
    pub participant_request: Option<ParticipantRequest>,
}

impl ReplicateMsg {
    /// Creates a write message carrying the given payload.
    #[must_use]
    pub const fn write(payload: Bytes) -> Self {
        Self {
            op_type: OpType::Write,
            id: None,
            timestamp: None,
            payload,
            new_quorum: None,
            participant_request: None,
        }
    }

    /// Creates a config-change message proposing the given quorum.
    #[must_use]
    pub const fn change_config(new_quorum: Quorum) -> Self {
        Self {
            op_type: OpType::ChangeConfig,
            id: None,
            timestamp: None,
            payload: Bytes::new(),
            new_quorum: Some(new_quorum),
            participant_request: None,
        }
    }

    /// Creates a participant-op message carrying the given request.
    #[must_use]
    pub const fn participant(request: ParticipantRequest) -> Self {
        Self {
            op_type: OpType::Participant,
            id: None,
            timestamp: None,
            payload: Bytes::new(),
            new_quorum: None,
            participant_request: Some(request),
        }
    }

    /// Returns true once the leader has assigned a log position.
    #[must_use]
    pub const fn has_id(&self) -> bool {
        self.id.is_some()
    }
}

/// Local record that an operation's apply completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMsg {
    /// Type of the operation that committed.
    pub op_type: OpType,
}

impl CommitMsg {
    /// Creates a commit record for the given operation type.
    #[must_use]
    pub const fn new(op_type: OpType) -> Self {
        Self { op_type }
    }

    /// Creates a commit record for a participant operation.
    #[must_use]
    pub const fn participant() -> Self {
        Self::new(OpType::Participant)
    }
}
