//! # Tidal Protocol
//!
//! Protocol-neutral types shared by the Tidal mutation pipeline and the sync
//! engine.
//!
//! This crate provides:
//! - `WriteIntent` / `WriteItem` for optimistic-concurrency writes
//! - `RemoteOp` / `RemoteOpResult` for batched remote execution
//! - `Change` records and the opaque `Cursor`
//! - `ConflictStrategy` and the intent-level conflict helper
//! - The `RemoteAuthority` trait implemented by transports
//! - CBOR helpers for durable bytes
//!
//! No wire encoding is imposed on transports. The CBOR helpers exist for
//! local durable storage only.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod authority;
mod codec;
mod conflict;
mod error;
mod messages;
mod write;

pub use authority::{ChangeStream, RemoteAuthority, SubscribeRequest};
pub use codec::{decode, encode};
pub use conflict::{resolve_conflict, Conflict, ConflictDecision, ConflictStrategy};
pub use error::{ProtocolError, ProtocolResult, TransportError};
pub use messages::{
    Change, ChangeBatch, CurrentSnapshot, Cursor, OpOutput, PullRequest, PullResponse,
    RemoteError, RemoteOp, RemoteOpResult, WriteAck, WriteItemOutcome, WriteReject,
    CONFLICT_CODE,
};
pub use write::{WriteAction, WriteIntent, WriteItem, WriteMeta, WriteOptions};
