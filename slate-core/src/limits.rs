//! Resource limits shared across the Slate crates.
//!
//! Following `TigerStyle`: every resource has an explicit, named bound
//! that is asserted at admission time.

/// Maximum number of peers in a quorum.
pub const QUORUM_PEERS_MAX: usize = 7;

/// Maximum number of operations pending in one replica at a time.
///
/// The leader stops admitting new rounds when this many replicates are
/// outstanding; the bound keeps the pending map and the shutdown drain small.
pub const PENDING_OPS_MAX: usize = 10_000;

/// Maximum number of worker threads in a callback pool.
pub const CALLBACK_POOL_WORKERS_MAX: usize = 16;

/// Maximum length in bytes of a peer's permanent UUID.
pub const PEER_UUID_LEN_MAX: usize = 64;
