//! Slate Tablet - transaction participant operations for one tablet replica.
//!
//! A tablet participating in a distributed transaction advances a
//! per-transaction state machine (`BEGIN_TXN`, `BEGIN_COMMIT`,
//! `FINALIZE_COMMIT`, `ABORT_TXN`) by running [`ParticipantOp`]s through the
//! consensus layer. Each op coordinates with the local MVCC manager so that
//! readers at timestamps after a commit-in-progress wait for its resolution.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Exclusive ownership**: one op holds a transaction's write lock at a time
//! - **Explicit resource transfer**: the commit MVCC op moves from op state
//!   to transaction at a single well-defined point
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;
mod mvcc;
mod participant_op;
mod txn;

pub use clock::TimeManager;
pub use error::{TxnError, TxnResult};
pub use mvcc::{MvccManager, MvccOpPhase, ScopedMvccOp};
pub use participant_op::{DriverType, OpResult, ParticipantOp, ParticipantOpState};
pub use txn::{Txn, TxnParticipant, TxnState, TxnWriteGuard};
