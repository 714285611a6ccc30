//! # Tidal Core
//!
//! Optimistic mutation pipeline for Tidal collections.
//!
//! This crate provides:
//! - The copy-on-write `EntityMap` with structural patches
//! - Collection handles with a per-collection operation scheduler
//! - Segment planning, write-intent encoding and rollback
//! - Direct and outbox persistence strategies
//! - A bounded, durable outbox queue
//! - Completion tickets, middleware and mutation events
//! - Pluggable durable key-value storage
//!
//! ## Pipeline
//!
//! Every dispatch flows through the same steps:
//! 1. Middleware may rewrite or reject the operation
//! 2. The scheduler groups consecutive operations into segments
//! 3. A segment is planned and its optimistic state is applied at once
//! 4. The writes are persisted directly or queued in the outbox
//! 5. Confirmed data is written back, or the optimistic state is reverted
//!
//! ## Key Invariants
//!
//! - Operations of a collection are applied in dispatch order
//! - A segment's optimistic state is visible in full or not at all
//! - A failed segment leaves the map as it was before the segment
//! - Every operation settles exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod entity;
mod error;
mod events;
mod middleware;
mod operation;
mod ticket;

pub mod outbox;
pub mod persist;
pub mod plan;
pub mod storage;
pub mod writeback;

pub use collection::{Collection, CollectionBuilder, Dispatched};
pub use config::CollectionConfig;
pub use entity::{
    idempotency_key, now_ms, temp_id, Draft, DraftResult, Entity, EntityMap, Patch, PatchOp,
    DELETED_AT_FIELD, DELETED_FIELD, ID_FIELD, TEMP_ID_PREFIX, UPDATED_AT_FIELD, VERSION_FIELD,
};
pub use error::{CoreError, CoreResult, StorageError, StorageResult};
pub use events::{EventBus, ListenerId, MutationEvent};
pub use middleware::{
    BeforeDispatch, BeforePersist, DispatchContext, DispatchDecision, MiddlewareChain,
    OutboxInstaller,
};
pub use operation::{
    Completion, DispatchOptions, DispatchOutcome, OnFail, OnSuccess, OpContext, Operation,
    OperationKind, PersistMode, TxKey,
};
pub use outbox::{OutboxConfig, OutboxEntry, OutboxQueue, WriteMode};
pub use persist::{PersistResult, PersistStatus};
pub use storage::{DurableStorage, FileStorage, MemoryStorage};
pub use ticket::{Ticket, TicketRegistry, TicketState};
