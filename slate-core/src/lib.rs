//! Slate Core - Strongly-typed identifiers and shared primitives for Slate.
//!
//! This crate provides the types shared by the consensus and tablet layers:
//! typed IDs, resource limits, the countdown latch used for blocking drains,
//! and the callback pool that runs completion callbacks off the hot path.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Strongly-typed IDs**: Prevent mixing up `TermId` with `LogIndex`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod latch;
pub mod limits;
mod pool;
mod types;

pub use latch::CountdownLatch;
pub use pool::CallbackPool;
pub use types::{LogIndex, PeerId, TabletId, TermId, Timestamp, TxnId};
