//! Consensus error types.

use thiserror::Error;

use crate::metadata::MetadataError;

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors that can occur in consensus state operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A caller-supplied value is invalid (e.g. starting in an older term,
    /// an unknown operation type).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument was rejected.
        message: String,
    },

    /// The operation is not permitted in the current lifecycle state or role.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Why the operation was rejected.
        message: String,
    },

    /// A watcher was registered for an operation that has already reached
    /// the requested watermark.
    #[error("already present: {message}")]
    AlreadyPresent {
        /// Which watermark the operation already passed.
        message: String,
    },

    /// The replica is shutting down and cannot accept the request.
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Why the replica is unavailable.
        message: String,
    },

    /// The operation was aborted before it completed.
    #[error("aborted: {message}")]
    Aborted {
        /// Why the operation was aborted.
        message: String,
    },

    /// A durable metadata flush failed; the in-memory state is unchanged.
    #[error("metadata flush failed")]
    Metadata {
        /// The underlying storage error.
        #[from]
        source: MetadataError,
    },
}

impl ConsensusError {
    /// Shorthand for an [`ConsensusError::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for an [`ConsensusError::IllegalState`] error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Shorthand for an [`ConsensusError::AlreadyPresent`] error.
    pub fn already_present(message: impl Into<String>) -> Self {
        Self::AlreadyPresent {
            message: message.into(),
        }
    }

    /// Shorthand for a [`ConsensusError::ServiceUnavailable`] error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Shorthand for an [`ConsensusError::Aborted`] error.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConsensusError::illegal_state("replica not in running state");
        assert_eq!(err.to_string(), "illegal state: replica not in running state");

        let err = ConsensusError::invalid_argument("cannot start in older term");
        assert!(err.to_string().contains("older term"));
    }
}
