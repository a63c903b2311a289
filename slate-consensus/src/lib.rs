//! Slate Consensus - per-replica Raft consensus state core.
//!
//! This crate is the authoritative in-memory representation of what a single
//! tablet replica knows about its quorum membership, its current term, its
//! vote record, the set of in-flight operations, and the replicated /
//! received / committed watermarks. All mutations go through [`ReplicaState`]
//! under a single serialization lock; durable consensus metadata is persisted
//! through [`ConsensusMetadata`] before new values become observable.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Single serialization point**: one lock covers all replica state
//! - **Durability before visibility**: term/vote/quorum flush before return
//! - **Explicit limits**: pending operations and quorum sizes are bounded
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod message;
mod metadata;
mod opid;
mod quorum;
mod state;
mod tracker;
mod watchers;

pub use error::{ConsensusError, ConsensusResult};
pub use message::{
    CommitMsg, OpType, ParticipantOpType, ParticipantRequest, ParticipantResponse, ReplicateMsg,
    TxnOpDescriptor,
};
pub use metadata::{
    ConsensusMetadata, ConsensusMetadataRecord, FileMetadataStorage, MemoryMetadataStorage,
    MetadataError, MetadataStorage,
};
pub use opid::OpId;
pub use quorum::{PeerRole, Quorum, QuorumPeer, QuorumSnapshot};
pub use state::{
    CommitContinuation, ConsensusOptions, Lifecycle, PendingOp, ReplicaState, StateGuard,
};
pub use tracker::MajorityTracker;
pub use watchers::{MarkMode, OpCallback, OpIdWatcherSet};
