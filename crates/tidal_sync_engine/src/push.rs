//! Outbox draining.
//!
//! A push claims entries from each outbox in FIFO order, sends them in as
//! few authority calls as possible, and settles each entry by its item
//! outcome. `CONFLICT` rejects go through the configured strategy; other
//! rejects are retried with backoff until the attempt budget runs out.

use crate::engine::EngineInner;
use crate::error::{SyncError, SyncResult};
use crate::lock::Acquire;
use crate::state::PushReport;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidal_core::persist::{batch_writes, unbatch_outcomes};
use tidal_core::{now_ms, Collection, CoreError, OutboxEntry, OutboxQueue};
use tidal_protocol::{
    resolve_conflict, ConflictDecision, TransportError, WriteAck, WriteIntent, WriteItemOutcome,
    WriteReject,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Holds the sync lock for one push and renews it in the background.
struct LockHold {
    inner: Arc<EngineInner>,
    lost: Arc<AtomicBool>,
    renewal: JoinHandle<()>,
}

impl LockHold {
    fn start(inner: &Arc<EngineInner>) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        let renewer = Arc::clone(inner);
        let every = inner
            .lock
            .config()
            .renew_interval
            .max(Duration::from_millis(10));
        let renewal = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match renewer.lock.renew() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!(error = %err, "sync lock renewal failed");
                        break;
                    }
                }
            }
            flag.store(true, Ordering::SeqCst);
        });
        Self {
            inner: Arc::clone(inner),
            lost,
            renewal,
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        self.renewal.abort();
        if !self.is_lost() {
            if let Err(err) = self.inner.lock.release() {
                warn!(error = %err, "failed to release sync lock");
            }
        }
    }
}

/// Error a dropped write's ticket fails with.
fn ticket_error(error: &SyncError) -> CoreError {
    match error {
        SyncError::Transport { message, retryable } => CoreError::Transport(TransportError {
            message: message.clone(),
            retryable: *retryable,
        }),
        SyncError::Timeout => CoreError::Transport(TransportError::retryable("request timed out")),
        SyncError::Core(core) => core.clone(),
        SyncError::Remote(remote) => CoreError::persistence(remote.clone(), None),
        SyncError::Rejected { error, .. } => CoreError::persistence(error.clone(), None),
        other => CoreError::Transport(TransportError::fatal(other.to_string())),
    }
}

impl EngineInner {
    /// Drains every registered outbox once under the sync lock.
    pub(crate) async fn push_all(self: &Arc<Self>) -> SyncResult<PushReport> {
        let queues = self.outboxes();
        let mut report = PushReport::default();
        if queues.iter().all(|(_, queue)| queue.is_empty()) {
            return Ok(report);
        }

        let hold = match self.lock.try_acquire()? {
            Acquire::Acquired => LockHold::start(self),
            Acquire::Held(record) => {
                return Err(SyncError::LockHeld {
                    holder: record.owner,
                })
            }
        };

        for (collection, queue) in &queues {
            loop {
                // claimed entries are settled before the next check, so a
                // lost lock leaves nothing in flight
                if hold.is_lost() {
                    return Err(SyncError::LockLost);
                }
                let batch = self.claim_batch(queue)?;
                if batch.is_empty() {
                    break;
                }
                let round = self.send_batch(collection, queue, batch).await?;
                report.merge(&round);
            }
        }

        if report.acked > 0 || report.conflicts > 0 || report.dropped > 0 {
            info!(
                acked = report.acked,
                conflicts = report.conflicts,
                retried = report.retried,
                dropped = report.dropped,
                "push finished"
            );
        }
        Ok(report)
    }

    /// Claims the next batch, stopping before a second write to an entity
    /// so that write is sent with the id and version the first one gets.
    fn claim_batch(&self, queue: &OutboxQueue) -> SyncResult<Vec<OutboxEntry>> {
        let mut claimed = queue.claim(self.config.push_batch_size, now_ms())?;
        let mut seen = HashSet::new();
        let repeat = claimed.iter().position(|entry| match entry.intent.entity_id() {
            Some(id) => !seen.insert(id.to_string()),
            None => false,
        });
        if let Some(cut) = repeat {
            let rest: Vec<u64> = claimed.drain(cut..).map(|e| e.seq).collect();
            queue.release(&rest)?;
        }
        Ok(claimed)
    }

    async fn send_batch(
        &self,
        collection: &Collection,
        queue: &OutboxQueue,
        batch: Vec<OutboxEntry>,
    ) -> SyncResult<PushReport> {
        let intents: Vec<&WriteIntent> = batch.iter().map(|e| &e.intent).collect();
        let (ops, groups) = batch_writes(&intents);
        debug!(
            collection = collection.name(),
            entries = batch.len(),
            requests = ops.len(),
            "pushing outbox batch"
        );

        let sent = self.execute(ops).await.and_then(|results| {
            unbatch_outcomes(results, &groups, batch.len()).map_err(SyncError::from)
        });
        let outcomes = match sent {
            Ok(outcomes) => outcomes,
            Err(err) => {
                let cause = ticket_error(&err);
                for entry in &batch {
                    self.retry_or_drop(collection, queue, entry, &cause)?;
                }
                return Err(err);
            }
        };

        let mut report = PushReport::default();
        for (entry, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                WriteItemOutcome::Ok(ack) => {
                    self.settle_ack(collection, queue, entry, &ack)?;
                    report.acked += 1;
                }
                WriteItemOutcome::Err(reject) => {
                    self.settle_reject(collection, queue, entry, &reject, &mut report)?;
                }
            }
        }
        Ok(report)
    }

    fn settle_ack(
        &self,
        collection: &Collection,
        queue: &OutboxQueue,
        entry: &OutboxEntry,
        ack: &WriteAck,
    ) -> SyncResult<()> {
        queue.ack(entry.seq)?;
        // later entries must name the confirmed id before the writeback
        // re-applies them over the acknowledged data
        if let Some(client_id) = entry.intent.entity_id() {
            if client_id != ack.entity_id {
                queue.rewrite_entity_id(client_id, &ack.entity_id)?;
            }
        }
        if let Some(base) = entry.intent.item.base_version {
            queue.advance_base_version(&ack.entity_id, base, ack.version)?;
        }
        collection.apply_remote_ack(&entry.intent, ack, &entry.ticket_key);
        self.stats.write().writes_pushed += 1;
        Ok(())
    }

    fn settle_reject(
        &self,
        collection: &Collection,
        queue: &OutboxQueue,
        entry: &OutboxEntry,
        reject: &WriteReject,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        collection.report_remote_reject(&entry.intent, reject);
        let failure = CoreError::persistence(reject.error.clone(), reject.current.clone());

        if !reject.error.is_conflict() {
            let will_retry = self.retry_or_drop(collection, queue, entry, &failure)?;
            if will_retry {
                report.retried += 1;
            } else {
                report.dropped += 1;
            }
            self.report_error(&SyncError::Rejected {
                collection: collection.name().to_string(),
                idempotency_key: entry.intent.idempotency_key().to_string(),
                error: reject.error.clone(),
                will_retry,
            });
            return Ok(());
        }

        report.conflicts += 1;
        self.stats.write().conflicts += 1;
        let strategy = self.config.conflict_strategy;
        match resolve_conflict(strategy, &entry.intent, reject) {
            ConflictDecision::ApplyServer { entity_id, current } => {
                collection.apply_server_copy(&entity_id, &current);
                self.discard(collection, queue, entry, failure)?;
                info!(
                    collection = collection.name(),
                    entity_id = %entity_id,
                    "conflict resolved with the server copy"
                );
            }
            ConflictDecision::Retry(rebased) => {
                if self.config.retry.is_exhausted(entry.attempts + 1) {
                    self.discard(collection, queue, entry, failure)?;
                    self.report_error(&SyncError::Rejected {
                        collection: collection.name().to_string(),
                        idempotency_key: entry.intent.idempotency_key().to_string(),
                        error: reject.error.clone(),
                        will_retry: false,
                    });
                } else {
                    queue.retry_later(entry.seq, now_ms(), Duration::ZERO)?;
                    queue.replace_intent(entry.seq, rebased)?;
                    report.retried += 1;
                    self.stats.write().retries += 1;
                    debug!(
                        collection = collection.name(),
                        seq = entry.seq,
                        "rebased conflicting write"
                    );
                }
            }
            ConflictDecision::Reject(conflict) => {
                self.discard(collection, queue, entry, failure)?;
                self.report_error(&SyncError::Rejected {
                    collection: collection.name().to_string(),
                    idempotency_key: conflict.intent.idempotency_key().to_string(),
                    error: conflict.error,
                    will_retry: false,
                });
            }
            ConflictDecision::Manual(conflict) => {
                self.discard(collection, queue, entry, failure)?;
                let error = SyncError::UnresolvedConflict {
                    collection: collection.name().to_string(),
                    entity_id: conflict.entity_id().map(String::from),
                };
                self.conflicts.lock().push(conflict);
                self.report_error(&error);
            }
        }
        Ok(())
    }

    /// Removes an entry for good and fails its ticket.
    fn discard(
        &self,
        collection: &Collection,
        queue: &OutboxQueue,
        entry: &OutboxEntry,
        error: CoreError,
    ) -> SyncResult<()> {
        queue.drop_entry(entry.seq)?;
        collection.fail_remote_write(&entry.ticket_key, error);
        self.stats.write().dropped += 1;
        Ok(())
    }

    /// Schedules another attempt, or discards the entry once the budget is
    /// spent. Returns true if the entry will be retried.
    fn retry_or_drop(
        &self,
        collection: &Collection,
        queue: &OutboxQueue,
        entry: &OutboxEntry,
        cause: &CoreError,
    ) -> SyncResult<bool> {
        let attempts = entry.attempts + 1;
        if self.config.retry.is_exhausted(attempts) {
            warn!(
                collection = collection.name(),
                seq = entry.seq,
                attempts,
                "giving up on outbox entry"
            );
            self.discard(collection, queue, entry, cause.clone())?;
            return Ok(false);
        }
        let delay = self.config.retry.delay_for_attempt(attempts);
        queue.retry_later(entry.seq, now_ms(), delay)?;
        self.stats.write().retries += 1;
        debug!(
            collection = collection.name(),
            seq = entry.seq,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "outbox entry scheduled for retry"
        );
        Ok(true)
    }
}
