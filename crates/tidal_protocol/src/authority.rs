//! The remote authority seam.

use crate::error::TransportError;
use crate::messages::{ChangeBatch, Cursor, RemoteOp, RemoteOpResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Live change notifications. The stream ends when the sender is dropped.
pub type ChangeStream = mpsc::Receiver<Result<ChangeBatch, TransportError>>;

/// Parameters of a live subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeRequest {
    /// Collections of interest. Empty means all.
    pub collections: Vec<String>,
    /// Stream position to resume from.
    pub cursor: Option<Cursor>,
}

/// The server of record.
///
/// Implement this trait to connect the engine to a backend (HTTP, in-memory,
/// local storage, ...). `execute` returns one result per operation, in
/// operation order; a failed call as a whole is a `TransportError`.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Executes a batch of operations.
    async fn execute(&self, ops: Vec<RemoteOp>) -> Result<Vec<RemoteOpResult>, TransportError>;

    /// Opens a live change stream.
    async fn subscribe(&self, _request: SubscribeRequest) -> Result<ChangeStream, TransportError> {
        Err(TransportError::unsupported("subscribe"))
    }
}
