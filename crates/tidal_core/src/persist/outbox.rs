//! Outbox persistence: queue now, replay later.

use super::{DirectPersister, PersistResult, PersistStatus, Persister};
use crate::error::{CoreError, CoreResult};
use crate::operation::PersistMode;
use crate::outbox::{OutboxQueue, WriteMode};
use crate::plan::PlannedWrite;
use crate::ticket::TicketRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Appends writes to a collection's outbox.
///
/// Enqueueing never touches the network. In `LocalFirst` mode the writes
/// are first executed against the local authority, and only queued if that
/// succeeds. Tickets of queued writes are registered so the sync engine can
/// settle them when the authority answers.
pub struct OutboxPersister {
    queue: Arc<OutboxQueue>,
    local: Option<DirectPersister>,
    tickets: Arc<TicketRegistry>,
}

impl OutboxPersister {
    /// Creates a persister for `queue`.
    ///
    /// `local` is required when the queue is configured `LocalFirst`.
    pub fn new(
        queue: Arc<OutboxQueue>,
        local: Option<DirectPersister>,
        tickets: Arc<TicketRegistry>,
    ) -> CoreResult<Self> {
        if queue.config().write_mode == WriteMode::LocalFirst && local.is_none() {
            return Err(CoreError::config(format!(
                "outbox of {} is local-first but has no local authority",
                queue.collection()
            )));
        }
        Ok(Self {
            queue,
            local,
            tickets,
        })
    }

    /// Returns the queue.
    pub fn queue(&self) -> &Arc<OutboxQueue> {
        &self.queue
    }
}

#[async_trait]
impl Persister for OutboxPersister {
    async fn persist(&self, collection: &str, writes: &[PlannedWrite]) -> CoreResult<PersistResult> {
        let result = PersistResult::empty(PersistMode::Outbox, PersistStatus::Enqueued);
        if writes.is_empty() {
            return Ok(result);
        }
        for write in writes {
            write.intent.validate(true)?;
        }

        if self.queue.config().write_mode == WriteMode::LocalFirst {
            if let Some(local) = &self.local {
                // local versions belong to the local authority; the cache keeps
                // the remote versions the queued writes are conditioned on
                let local_result = local.persist(collection, writes).await?;
                debug!(
                    collection,
                    items = writes.len(),
                    local_versions = local_result.writeback.version_updates.len(),
                    "applied writes locally"
                );
            }
        }

        for write in writes {
            self.tickets.register(&write.ticket);
        }
        let entries = writes
            .iter()
            .map(|w| (w.intent.clone(), w.ticket.idempotency_key().to_string()))
            .collect();
        let report = match self.queue.enqueue(entries) {
            Ok(report) => report,
            Err(err) => {
                for write in writes {
                    self.tickets.forget(write.ticket.idempotency_key());
                }
                return Err(err);
            }
        };

        for evicted in &report.evicted {
            self.tickets
                .fail(&evicted.ticket_key, CoreError::Evicted { seq: evicted.seq });
        }
        debug!(collection, seqs = ?report.seqs, "queued writes");
        Ok(result)
    }
}
