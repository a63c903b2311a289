//! Transaction participant error types.

use slate_core::TxnId;
use thiserror::Error;

use crate::txn::TxnState;

/// Result type for transaction participant operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors from transaction participant operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// A caller-supplied value is invalid (e.g. an unknown op type, a
    /// finalize without a commit timestamp).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument was rejected.
        message: String,
    },

    /// The requested transition is not legal from the transaction's current
    /// state.
    #[error("transaction {txn_id}: cannot {op} while in state {state}")]
    IllegalTransition {
        /// The transaction.
        txn_id: TxnId,
        /// The operation that was attempted.
        op: &'static str,
        /// The state the transaction is in.
        state: TxnState,
    },

    /// The operation was aborted before it completed.
    #[error("aborted: {message}")]
    Aborted {
        /// Why the operation was aborted.
        message: String,
    },
}

impl TxnError {
    /// Shorthand for an [`TxnError::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for an [`TxnError::Aborted`] error.
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
        let err = TxnError::IllegalTransition {
            txn_id: TxnId::new(7),
            op: "FINALIZE_COMMIT",
            state: TxnState::Open,
        };
        let msg = err.to_string();
        assert!(msg.contains("txn-7"));
        assert!(msg.contains("FINALIZE_COMMIT"));
        assert!(msg.contains("OPEN"));
    }
}
