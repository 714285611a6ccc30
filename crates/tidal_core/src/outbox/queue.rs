//! The outbox queue.
//!
//! # Invariants
//!
//! - Entries keep insertion order; `seq` is strictly increasing
//! - The queue never holds more than `max_size` entries
//! - Every mutation is written to durable storage before it is visible;
//!   a failed write leaves the in-memory queue unchanged
//! - `claim` hands out a contiguous prefix, so later writes to an entity
//!   are never sent before earlier ones

use super::OutboxConfig;
use crate::entity::{now_ms, ID_FIELD};
use crate::error::CoreResult;
use crate::events::guarded;
use crate::storage::{self, DurableStorage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tidal_protocol::WriteIntent;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A queued write intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Insertion sequence number.
    pub seq: u64,
    /// The write to replay.
    pub intent: WriteIntent,
    /// Idempotency key of the ticket to settle. Survives rebasing.
    pub ticket_key: String,
    /// True while the entry is being sent.
    pub in_flight: bool,
    /// When the entry was claimed for sending.
    pub claimed_at_ms: Option<i64>,
    /// Failed send attempts so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at_ms: Option<i64>,
    /// When the entry was enqueued.
    pub enqueued_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    next_seq: u64,
    entries: VecDeque<OutboxEntry>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueReport {
    /// Sequence numbers of the new entries.
    pub seqs: Vec<u64>,
    /// Entries evicted to respect `max_size`, oldest first.
    pub evicted: Vec<OutboxEntry>,
}

/// A bounded, durable FIFO of write intents for one collection.
pub struct OutboxQueue {
    collection: String,
    key: String,
    storage: Arc<dyn DurableStorage>,
    config: OutboxConfig,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
}

impl OutboxQueue {
    /// Opens the queue of `collection`, restoring persisted entries.
    ///
    /// Entries left in flight by a previous process are made claimable again.
    pub fn open(
        collection: impl Into<String>,
        storage: Arc<dyn DurableStorage>,
        config: OutboxConfig,
    ) -> CoreResult<Self> {
        let collection = collection.into();
        let key = config.key_for(&collection);
        let mut state: QueueState = storage::load(storage.as_ref(), &key)?.unwrap_or_default();

        let mut resumed = 0;
        for entry in state.entries.iter_mut().filter(|e| e.in_flight) {
            entry.in_flight = false;
            entry.claimed_at_ms = None;
            resumed += 1;
        }
        debug!(
            collection = %collection,
            entries = state.entries.len(),
            resumed,
            "opened outbox"
        );

        Ok(Self {
            collection,
            key,
            storage,
            config,
            state: Mutex::new(state),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Returns the collection this queue belongs to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Returns the notifier signalled after every enqueue.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Applies `f` to a copy of the state, persists it and publishes it.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> CoreResult<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let result = f(&mut next);
        storage::store(self.storage.as_ref(), &self.key, &next)?;
        *state = next;
        Ok(result)
    }

    /// Appends intents as one unit.
    ///
    /// Every intent is validated before anything is queued, so a bad intent
    /// leaves the queue untouched. Entries beyond `max_size` are evicted
    /// oldest first and reported through `on_queue_full`.
    pub fn enqueue(&self, intents: Vec<(WriteIntent, String)>) -> CoreResult<EnqueueReport> {
        for (intent, _) in &intents {
            intent.validate(true)?;
        }
        if intents.is_empty() {
            return Ok(EnqueueReport::default());
        }

        let now = now_ms();
        let max_size = self.config.max_size.max(1);
        let report = self.mutate(|state| {
            let mut report = EnqueueReport::default();
            for (intent, ticket_key) in intents {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.entries.push_back(OutboxEntry {
                    seq,
                    intent,
                    ticket_key,
                    in_flight: false,
                    claimed_at_ms: None,
                    attempts: 0,
                    next_attempt_at_ms: None,
                    enqueued_at_ms: now,
                });
                report.seqs.push(seq);
            }
            while state.entries.len() > max_size {
                if let Some(evicted) = state.entries.pop_front() {
                    report.evicted.push(evicted);
                }
            }
            report
        })?;

        debug!(
            collection = %self.collection,
            added = report.seqs.len(),
            evicted = report.evicted.len(),
            "enqueued outbox entries"
        );
        for entry in &report.evicted {
            warn!(collection = %self.collection, seq = entry.seq, "outbox full, evicted oldest entry");
            if let Some(on_full) = &self.config.on_queue_full {
                guarded("on_queue_full", || on_full(entry));
            }
        }
        self.notify.notify_one();
        Ok(report)
    }

    /// Claims up to `max` entries for sending, in FIFO order.
    ///
    /// In-flight entries older than `in_flight_timeout` are reclaimed first.
    /// Claiming stops at the first entry that is in flight or backing off.
    pub fn claim(&self, max: usize, now_ms: i64) -> CoreResult<Vec<OutboxEntry>> {
        let timeout_ms = self.config.in_flight_timeout.as_millis() as i64;
        let collection = &self.collection;
        self.mutate(|state| {
            for entry in state.entries.iter_mut().filter(|e| e.in_flight) {
                if entry.claimed_at_ms.is_some_and(|at| now_ms - at >= timeout_ms) {
                    warn!(collection = %collection, seq = entry.seq, "reclaiming stuck in-flight entry");
                    entry.in_flight = false;
                    entry.claimed_at_ms = None;
                }
            }

            let mut claimed = Vec::new();
            for entry in state.entries.iter_mut() {
                if claimed.len() >= max
                    || entry.in_flight
                    || entry.next_attempt_at_ms.is_some_and(|at| at > now_ms)
                {
                    break;
                }
                entry.in_flight = true;
                entry.claimed_at_ms = Some(now_ms);
                claimed.push(entry.clone());
            }
            claimed
        })
    }

    /// Removes an acknowledged entry.
    pub fn ack(&self, seq: u64) -> CoreResult<Option<OutboxEntry>> {
        let removed = self.remove(seq)?;
        if removed.is_some() {
            debug!(collection = %self.collection, seq, "acked outbox entry");
        }
        Ok(removed)
    }

    /// Drops an entry that will not be retried.
    pub fn drop_entry(&self, seq: u64) -> CoreResult<Option<OutboxEntry>> {
        let removed = self.remove(seq)?;
        if removed.is_some() {
            warn!(collection = %self.collection, seq, "dropped outbox entry");
        }
        Ok(removed)
    }

    fn remove(&self, seq: u64) -> CoreResult<Option<OutboxEntry>> {
        self.mutate(|state| {
            let index = state.entries.iter().position(|e| e.seq == seq)?;
            state.entries.remove(index)
        })
    }

    /// Returns a claimed entry to the queue after a failed attempt.
    ///
    /// The entry becomes claimable again after `delay`. Returns the number
    /// of failed attempts so far, or `None` if the entry is gone.
    pub fn retry_later(&self, seq: u64, now_ms: i64, delay: Duration) -> CoreResult<Option<u32>> {
        self.mutate(|state| {
            let entry = state.entries.iter_mut().find(|e| e.seq == seq)?;
            entry.in_flight = false;
            entry.claimed_at_ms = None;
            entry.attempts += 1;
            entry.next_attempt_at_ms = Some(now_ms + delay.as_millis() as i64);
            Some(entry.attempts)
        })
    }

    /// Replaces the intent of an entry and makes it claimable immediately.
    ///
    /// Used to retry a write rebased onto the authority's current version.
    pub fn replace_intent(&self, seq: u64, intent: WriteIntent) -> CoreResult<bool> {
        intent.validate(true)?;
        self.mutate(|state| match state.entries.iter_mut().find(|e| e.seq == seq) {
            Some(entry) => {
                entry.intent = intent;
                entry.in_flight = false;
                entry.claimed_at_ms = None;
                entry.next_attempt_at_ms = None;
                true
            }
            None => false,
        })
    }

    /// Points queued writes at `to` instead of `from`.
    ///
    /// Applied when the authority confirmed a create under a different id
    /// than the client used, so later writes to the entity follow it.
    /// In-flight entries are left alone. Returns the number of rewritten
    /// entries.
    pub fn rewrite_entity_id(&self, from: &str, to: &str) -> CoreResult<usize> {
        if from == to {
            return Ok(0);
        }
        let rewritten = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .any(|e| !e.in_flight && e.intent.entity_id() == Some(from))
        };
        if !rewritten {
            return Ok(0);
        }
        let count = self.mutate(|state| {
            let mut count = 0;
            for entry in state
                .entries
                .iter_mut()
                .filter(|e| !e.in_flight && e.intent.entity_id() == Some(from))
            {
                entry.intent.item.entity_id = Some(to.to_string());
                if let Some(Value::Object(fields)) = entry.intent.item.value.as_mut() {
                    if fields.get(ID_FIELD).and_then(Value::as_str) == Some(from) {
                        fields.insert(ID_FIELD.to_string(), Value::String(to.to_string()));
                    }
                }
                count += 1;
            }
            count
        })?;
        debug!(collection = %self.collection, from, to, count, "rewrote queued entity ids");
        Ok(count)
    }

    /// Returns claimed entries to the queue without counting an attempt.
    pub fn release(&self, seqs: &[u64]) -> CoreResult<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }
        self.mutate(|state| {
            let mut released = 0;
            for entry in state.entries.iter_mut().filter(|e| seqs.contains(&e.seq)) {
                entry.in_flight = false;
                entry.claimed_at_ms = None;
                released += 1;
            }
            released
        })
    }

    /// Moves queued writes planned against `from` onto `to`.
    ///
    /// A write queued behind another write to the same entity carries the
    /// version both were planned against. Once the earlier write is acked,
    /// the later one must expect the version the authority assigned.
    pub fn advance_base_version(&self, entity_id: &str, from: i64, to: i64) -> CoreResult<usize> {
        let affected = |e: &OutboxEntry| {
            !e.in_flight
                && e.intent.entity_id() == Some(entity_id)
                && e.intent.item.base_version == Some(from)
        };
        if from == to || !self.state.lock().entries.iter().any(affected) {
            return Ok(0);
        }
        let count = self.mutate(|state| {
            let mut count = 0;
            for entry in state.entries.iter_mut().filter(|e| affected(e)) {
                entry.intent.item.base_version = Some(to);
                count += 1;
            }
            count
        })?;
        debug!(collection = %self.collection, entity_id, from, to, count, "advanced queued base versions");
        Ok(count)
    }

    /// Returns a copy of all entries in order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns the number of entries not in flight.
    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.iter().filter(|e| !e.in_flight).count()
    }

    /// Returns the number of in-flight entries.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().entries.iter().filter(|e| e.in_flight).count()
    }
}

impl std::fmt::Debug for OutboxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue")
            .field("collection", &self.collection)
            .field("key", &self.key)
            .field("len", &self.len())
            .finish()
    }
}
