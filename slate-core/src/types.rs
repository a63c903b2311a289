//! Strongly-typed identifiers for Slate entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! Numeric IDs are 64-bit to handle large-scale deployments; peers are
//! identified by their permanent UUID string assigned at provisioning time.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `TermId` with `LogIndex`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Consensus.
define_id!(TermId, "term", "Raft term number; within a term at most one leader exists.");
define_id!(LogIndex, "idx", "Index into the replicated operation log.");

// Tablet and transaction identification.
define_id!(TabletId, "tablet", "Unique identifier for a tablet (one replicated log each).");
define_id!(TxnId, "txn", "Unique identifier for a distributed transaction.");

/// Permanent UUID of a peer replica.
///
/// Assigned once at provisioning time and never reused. Unlike the numeric
/// IDs this is an opaque string so quorum records survive node renumbering.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer ID from a UUID string.
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    /// Returns the UUID as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the UUID is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(uuid: &str) -> Self {
        Self::new(uuid)
    }
}

impl From<String> for PeerId {
    fn from(uuid: String) -> Self {
        Self(uuid)
    }
}

/// A hybrid-clock timestamp.
///
/// Totally ordered across the cluster. The clock internals are owned by the
/// time manager; consumers only compare and propagate these values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The minimum representable timestamp.
    pub const MIN: Self = Self(0);

    /// Creates a timestamp from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts-{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let term = TermId::new(1);
        let index = LogIndex::new(1);

        // These are different types even with same value.
        assert_eq!(term.get(), index.get());
        // But they can't be compared directly (won't compile):
        // assert_ne!(term, index);
    }

    #[test]
    fn test_id_display() {
        let term = TermId::new(42);
        assert_eq!(format!("{term}"), "term-42");
        assert_eq!(format!("{term:?}"), "term(42)");
    }

    #[test]
    fn test_id_next() {
        let idx = LogIndex::new(0);
        assert_eq!(idx.next().get(), 1);
        assert_eq!(idx.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let idx = LogIndex::new(u64::MAX);
        let _ = idx.next();
    }

    #[test]
    fn test_peer_id() {
        let a = PeerId::new("peer-a");
        let b = PeerId::from("peer-a");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "peer-a");
        assert!(!a.is_empty());
        assert!(PeerId::default().is_empty());
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::MIN < Timestamp::new(1));
        assert!(Timestamp::new(100) < Timestamp::new(105));
    }
}
