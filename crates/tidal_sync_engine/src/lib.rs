//! # Tidal Sync Engine
//!
//! Reconciles Tidal collections with a remote authority.
//!
//! This crate provides:
//! - Pull: fetch change batches after a durable cursor
//! - Push: drain collection outboxes under a cross-instance lock
//! - Subscribe: apply live change notifications, reconnecting as needed
//! - Conflict handling at reject time (`server-wins`, `client-wins`,
//!   `reject`, `manual`)
//! - Retry with exponential backoff and jitter
//! - Five operating modes started and stopped as a unit
//!
//! ## Architecture
//!
//! Local writes never wait for the engine. Collections commit optimistic
//! state and queue write intents in their outbox; the engine replays the
//! queue and feeds acknowledgements, rejects and remote changes back into
//! the collections.
//!
//! ## Key Invariants
//!
//! - The cursor advances only after the changes before it are applied
//! - Outbox entries are sent in FIFO order and removed only when settled
//! - Replayed writes keep their idempotency key, so a retry after a lost
//!   acknowledgement has no second effect
//! - Only the holder of the sync lock drains the outbox

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod engine;
mod error;
mod lock;
mod push;
mod state;
mod tasks;

pub use config::{LockConfig, RetryConfig, SubscribeConfig, SyncConfig, SyncMode};
pub use cursor::CursorStore;
pub use engine::{ErrorHook, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use lock::{Acquire, LockRecord, SyncLock};
pub use state::{PushReport, SyncCycleResult, SyncState, SyncStats, SyncStatus};
