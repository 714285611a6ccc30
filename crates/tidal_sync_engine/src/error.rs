//! Error types for the sync engine.

use thiserror::Error;
use tidal_core::{CoreError, StorageError};
use tidal_protocol::{RemoteError, TransportError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The authority answered with something the engine cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authority failed a whole operation.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The authority rejected a pushed write.
    #[error("write {idempotency_key} to {collection} rejected: {error}")]
    Rejected {
        /// Collection of the write.
        collection: String,
        /// Idempotency key of the write.
        idempotency_key: String,
        /// The authority's error.
        error: RemoteError,
        /// Whether the write will be retried.
        will_retry: bool,
    },

    /// A conflict was left for the caller to resolve.
    #[error("unresolved conflict for entity {entity_id:?} in collection {collection}")]
    UnresolvedConflict {
        /// Collection of the write.
        collection: String,
        /// Entity the conflict is about.
        entity_id: Option<String>,
    },

    /// Pipeline error while applying sync results.
    #[error("pipeline error: {0}")]
    Core(#[from] CoreError),

    /// Cursor or lock storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Another engine instance holds the sync lock.
    #[error("sync lock held by {holder}")]
    LockHeld {
        /// Owner id of the current holder.
        holder: String,
    },

    /// The sync lock expired or was taken over mid-push.
    #[error("sync lock lost")]
    LockLost,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Background loops need a Tokio runtime.
    #[error("no tokio runtime to run sync loops on")]
    NoRuntime,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Rejected { will_retry, .. } => *will_retry,
            SyncError::Timeout | SyncError::LockHeld { .. } | SyncError::LockLost => true,
            SyncError::Remote(_) => true,
            _ => false,
        }
    }

    /// Returns true for a `CONFLICT` outcome.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Rejected { error, .. } | SyncError::Remote(error) => error.is_conflict(),
            SyncError::UnresolvedConflict { .. } => true,
            SyncError::Core(core) => core.is_conflict(),
            _ => false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        SyncError::Transport {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::LockLost.is_retryable());
        assert!(!SyncError::Protocol("bad output".into()).is_retryable());
        assert!(SyncError::from(TransportError::retryable("reset")).is_retryable());
    }

    #[test]
    fn conflicts_are_recognised() {
        let rejected = SyncError::Rejected {
            collection: "todos".into(),
            idempotency_key: "k".into(),
            error: RemoteError::conflict("stale"),
            will_retry: false,
        };
        assert!(rejected.is_conflict());
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("CONFLICT"));
        assert!(!SyncError::Timeout.is_conflict());
    }

    #[test]
    fn error_display() {
        let err = SyncError::LockHeld {
            holder: "tab-2".into(),
        };
        assert_eq!(err.to_string(), "sync lock held by tab-2");
    }
}
