//! Error types for the protocol layer.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or encoding protocol values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A write that needs an optimistic-concurrency precondition has none.
    #[error("[requires baseVersion] {action} of {entity_id} has no positive base version")]
    MissingBaseVersion {
        /// The write action.
        action: String,
        /// The target entity.
        entity_id: String,
    },

    /// A write that targets an existing entity has no entity id.
    #[error("{action} write requires an entity id")]
    MissingEntityId {
        /// The write action.
        action: String,
    },

    /// A server-assigned create carries a base version.
    #[error("server-assigned create must not carry a base version")]
    UnexpectedBaseVersion,

    /// A server-assigned create was routed to the outbox.
    #[error("server-assigned create cannot be queued in the outbox of {collection}")]
    UnreplayableCreate {
        /// The collection the write targets.
        collection: String,
    },

    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Error returned by a `RemoteAuthority` when the call itself fails.
///
/// Per-operation and per-item failures are reported inside the results, not
/// through this type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport error: {message}")]
pub struct TransportError {
    /// Error message.
    pub message: String,
    /// Whether the call can be retried.
    pub retryable: bool,
}

impl TransportError {
    /// Creates a retryable transport error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates the error returned when a transport lacks a capability.
    pub fn unsupported(capability: &str) -> Self {
        Self::fatal(format!("{capability} is not supported by this transport"))
    }
}
