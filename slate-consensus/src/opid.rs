//! Operation identifiers for the replicated log.

use std::fmt;

use slate_core::{LogIndex, TermId};

/// Identifier of one operation in the replicated log.
///
/// Ordering is lexicographic: first by term, then by index. Two `OpId`s with
/// equal term always have distinct indices; indices within a term are
/// contiguous starting at the first index assigned when the term began.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId {
    /// Term in which the operation was assigned.
    pub term: TermId,
    /// Index of the operation within the log.
    pub index: LogIndex,
}

impl OpId {
    /// The minimum operation id, used as the initial watermark value.
    pub const MIN: Self = Self {
        term: TermId::new(0),
        index: LogIndex::new(0),
    };

    /// Creates an operation id from a term and an index.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex) -> Self {
        Self { term, index }
    }

    /// Returns the id that directly follows this one within the same term.
    ///
    /// # Panics
    /// Panics if the index would overflow.
    #[must_use]
    pub const fn next_in_term(self) -> Self {
        Self {
            term: self.term,
            index: self.index.next(),
        }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op({}.{})", self.term.get(), self.index.get())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term.get(), self.index.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(term: u64, index: u64) -> OpId {
        OpId::new(TermId::new(term), LogIndex::new(index))
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(op(1, 5) < op(1, 6));
        assert!(op(1, 100) < op(2, 1));
        assert!(op(2, 1) > op(1, 100));
        assert_eq!(op(3, 7), op(3, 7));
    }

    #[test]
    fn test_min_is_smallest() {
        assert!(OpId::MIN <= op(0, 0));
        assert!(OpId::MIN < op(0, 1));
        assert!(OpId::MIN < op(1, 0));
    }

    #[test]
    fn test_next_in_term() {
        assert_eq!(op(5, 10).next_in_term(), op(5, 11));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", op(5, 10)), "5.10");
    }
}
