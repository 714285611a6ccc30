//! Engine state and statistics.

use crate::config::SyncMode;
use std::time::{Duration, Instant};
use tidal_protocol::Cursor;

/// The current activity of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing has run yet, or the engine was stopped.
    Idle,
    /// Pulling changes from the authority.
    Pulling,
    /// Draining outboxes.
    Pushing,
    /// The last pull or push finished cleanly.
    Synced,
    /// The last pull or push failed.
    Error,
    /// Waiting before retrying a failed push.
    RetryWait,
}

impl SyncState {
    /// Returns true if a pull or push is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed `sync_once` cycles.
    pub cycles_completed: u64,
    /// Remote changes applied from pulls and subscriptions.
    pub changes_pulled: u64,
    /// Outbox entries acknowledged by the authority.
    pub writes_pushed: u64,
    /// `CONFLICT` rejects seen while pushing.
    pub conflicts: u64,
    /// Outbox entries scheduled for another attempt.
    pub retries: u64,
    /// Outbox entries dropped without being applied.
    pub dropped: u64,
    /// Subscriptions opened, including reconnects.
    pub subscriptions: u64,
    /// When the last pull or push finished cleanly.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Snapshot reported by `SyncEngine::status`.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current activity.
    pub state: SyncState,
    /// Mode of the background loops, if started.
    pub mode: Option<SyncMode>,
    /// Stored cursor.
    pub cursor: Option<Cursor>,
    /// Outbox entries across registered collections.
    pub pending_writes: usize,
    /// Outbox entries currently claimed for sending.
    pub in_flight_writes: usize,
    /// Whether this instance holds the sync lock.
    pub lock_held: bool,
    /// Unresolved conflicts waiting in `take_conflicts`.
    pub unresolved_conflicts: usize,
    /// Lifetime counters.
    pub stats: SyncStats,
}

impl SyncStatus {
    /// Returns true if background loops are running.
    pub fn is_running(&self) -> bool {
        self.mode.is_some()
    }
}

/// Result of a `sync_once` cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Remote changes applied.
    pub pulled: u64,
    /// Outcome of draining the outboxes.
    pub push: PushReport,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// What one push pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Entries acknowledged.
    pub acked: u64,
    /// Entries resolved by a conflict strategy (applied, rebased or dropped).
    pub conflicts: u64,
    /// Entries scheduled for another attempt.
    pub retried: u64,
    /// Entries dropped after a non-conflict reject exhausted its retries.
    pub dropped: u64,
}

impl PushReport {
    pub(crate) fn merge(&mut self, other: &PushReport) {
        self.acked += other.acked;
        self.conflicts += other.conflicts;
        self.retried += other.retried;
        self.dropped += other.dropped;
    }
}
