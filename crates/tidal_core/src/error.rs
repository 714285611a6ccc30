//! Error types for Tidal core.

use std::time::Duration;
use thiserror::Error;
use tidal_protocol::{CurrentSnapshot, ProtocolError, RemoteError, TransportError};

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by durable storage backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be decoded.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Errors that can occur in the mutation pipeline.
///
/// Errors are `Clone` because a failed segment settles every one of its
/// operations with the same error.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A write intent failed validation (missing base version, bad create).
    #[error("validation error: {0}")]
    Validation(#[from] ProtocolError),

    /// A segment mixes operation kinds that cannot be planned together.
    #[error("batching conflict: {message}")]
    BatchingConflict {
        /// Description of the conflicting kinds.
        message: String,
    },

    /// The collection has no outbox but outbox persistence was requested.
    #[error("collection {collection} has no outbox configured")]
    OutboxNotConfigured {
        /// Collection name.
        collection: String,
    },

    /// Direct persistence was requested without a remote authority.
    #[error("collection {collection} has no remote authority")]
    NoRemote {
        /// Collection name.
        collection: String,
    },

    /// The target entity is not in the cache.
    #[error("entity {entity_id} not found in {collection}")]
    EntityNotFound {
        /// Collection name.
        collection: String,
        /// Missing entity id.
        entity_id: String,
    },

    /// A value is not a usable entity (not an object, no id).
    #[error("invalid entity: {message}")]
    InvalidEntity {
        /// Description of the problem.
        message: String,
    },

    /// A structural patch could not be applied.
    #[error("invalid patch: {message}")]
    InvalidPatch {
        /// Description of the problem.
        message: String,
    },

    /// The remote authority rejected a write or operation.
    #[error("persistence failed: {error}")]
    Persistence {
        /// The authority's error.
        error: RemoteError,
        /// The authority's copy of the entity, sent with conflicts.
        current: Option<CurrentSnapshot>,
    },

    /// The remote call itself failed.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// A strict caller stopped waiting for confirmation.
    #[error("timed out after {waited:?} waiting for confirmation")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// A `beforeDispatch` middleware rejected the operation.
    #[error("dispatch rejected: {reason}")]
    Rejected {
        /// Reason given by the middleware.
        reason: String,
    },

    /// The entry was evicted from a full outbox before it was sent.
    #[error("outbox entry {seq} evicted from a full queue")]
    Evicted {
        /// Sequence number of the evicted entry.
        seq: u64,
    },

    /// A collection or dispatch was set up inconsistently.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The pipeline was dropped before the operation settled.
    #[error("mutation pipeline closed")]
    Closed,
}

impl CoreError {
    /// Creates a batching conflict error.
    pub fn batching_conflict(message: impl Into<String>) -> Self {
        Self::BatchingConflict {
            message: message.into(),
        }
    }

    /// Creates an invalid entity error.
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Creates an invalid patch error.
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a persistence error from a remote error.
    pub fn persistence(error: RemoteError, current: Option<CurrentSnapshot>) -> Self {
        Self::Persistence { error, current }
    }

    /// Creates an entity-not-found error.
    pub fn not_found(collection: &str, entity_id: &str) -> Self {
        Self::EntityNotFound {
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    /// Returns true for errors raised before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::Validation(_)
                | CoreError::BatchingConflict { .. }
                | CoreError::OutboxNotConfigured { .. }
                | CoreError::NoRemote { .. }
                | CoreError::InvalidEntity { .. }
                | CoreError::InvalidPatch { .. }
                | CoreError::Config { .. }
        )
    }

    /// Returns true for a strict-mode confirmation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout { .. })
    }

    /// Returns true for a `CONFLICT` reject from the authority.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Persistence { error, .. } if error.is_conflict())
    }
}
