//! Completion tickets.
//!
//! A ticket follows one dispatched write from the moment it is accepted
//! until the authority confirms or rejects it:
//!
//! ```text
//! Pending ──► Enqueued ──► Confirmed
//!    │            │
//!    └────────────┴──────► Failed
//! ```
//!
//! Transitions out of a terminal state are ignored, so a late settle after
//! a strict-mode timeout is harmless.

use crate::entity::{idempotency_key, now_ms};
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a ticket.
#[derive(Debug, Clone)]
pub enum TicketState {
    /// Accepted, not yet persisted.
    Pending,
    /// Committed locally; the write is queued or in flight.
    Enqueued,
    /// The authority confirmed the write.
    Confirmed,
    /// The write failed.
    Failed(CoreError),
}

impl TicketState {
    /// Returns true for `Confirmed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Confirmed | TicketState::Failed(_))
    }
}

struct TicketInner {
    idempotency_key: String,
    client_time_ms: i64,
    state: watch::Sender<TicketState>,
}

/// Shared handle on a write's completion state.
#[derive(Clone)]
pub struct Ticket {
    inner: Arc<TicketInner>,
}

impl Ticket {
    /// Creates a ticket with a fresh idempotency key.
    pub fn new() -> Self {
        Self::with_key(idempotency_key(), now_ms())
    }

    /// Creates a ticket with an explicit idempotency key and client time.
    pub fn with_key(idempotency_key: impl Into<String>, client_time_ms: i64) -> Self {
        let (state, _) = watch::channel(TicketState::Pending);
        Self {
            inner: Arc::new(TicketInner {
                idempotency_key: idempotency_key.into(),
                client_time_ms,
                state,
            }),
        }
    }

    /// Returns the idempotency key.
    pub fn idempotency_key(&self) -> &str {
        &self.inner.idempotency_key
    }

    /// Returns the client time the ticket was issued at.
    pub fn client_time_ms(&self) -> i64 {
        self.inner.client_time_ms
    }

    /// Returns the current state.
    pub fn state(&self) -> TicketState {
        self.inner.state.borrow().clone()
    }

    /// Returns true once the ticket is confirmed or failed.
    pub fn is_settled(&self) -> bool {
        self.inner.state.borrow().is_terminal()
    }

    /// `Pending → Enqueued`. Returns false if the transition did not apply.
    pub fn mark_enqueued(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, TicketState::Pending) {
                *state = TicketState::Enqueued;
                true
            } else {
                false
            }
        })
    }

    /// `Pending | Enqueued → Confirmed`.
    pub fn confirm(&self) -> bool {
        self.settle(TicketState::Confirmed)
    }

    /// `Pending | Enqueued → Failed`.
    pub fn fail(&self, error: CoreError) -> bool {
        self.settle(TicketState::Failed(error))
    }

    fn settle(&self, terminal: TicketState) -> bool {
        let applied = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
        if !applied {
            debug!(key = %self.idempotency_key(), "ignoring settle of a settled ticket");
        }
        applied
    }

    /// Waits until the ticket is confirmed.
    ///
    /// Returns the failure error if the write failed, or
    /// [`CoreError::Timeout`] if `timeout` elapses first. The ticket itself
    /// is left untouched by a timeout.
    pub async fn wait_confirmed(&self, timeout: Option<Duration>) -> CoreResult<()> {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            let state = rx
                .wait_for(TicketState::is_terminal)
                .await
                .map_err(|_| CoreError::Closed)?;
            match &*state {
                TicketState::Failed(err) => Err(err.clone()),
                _ => Ok(()),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CoreError::Timeout { waited: limit })?,
            None => wait.await,
        }
    }
}

impl Default for Ticket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("idempotency_key", &self.inner.idempotency_key)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Tickets of queued writes, keyed by idempotency key.
///
/// Outbox writes stay `Enqueued` after the local commit; the sync engine
/// settles them through this registry when the authority answers. One
/// operation may queue several writes under the same ticket: it confirms
/// once every one of them is acknowledged and fails on the first drop.
#[derive(Debug, Default)]
pub struct TicketRegistry {
    tickets: Mutex<HashMap<String, Tracked>>,
}

#[derive(Debug)]
struct Tracked {
    ticket: Ticket,
    outstanding: usize,
}

impl TicketRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one outstanding write of a ticket.
    pub fn register(&self, ticket: &Ticket) {
        self.tickets
            .lock()
            .entry(ticket.idempotency_key().to_string())
            .or_insert_with(|| Tracked {
                ticket: ticket.clone(),
                outstanding: 0,
            })
            .outstanding += 1;
    }

    /// Records one acknowledged write. The ticket is confirmed and
    /// forgotten when it was the last outstanding one; returns true then.
    pub fn confirm(&self, key: &str) -> bool {
        let mut tickets = self.tickets.lock();
        let Some(tracked) = tickets.get_mut(key) else {
            return false;
        };
        tracked.outstanding = tracked.outstanding.saturating_sub(1);
        if tracked.outstanding > 0 {
            return false;
        }
        match tickets.remove(key) {
            Some(tracked) => tracked.ticket.confirm(),
            None => false,
        }
    }

    /// Fails and forgets the ticket. Returns false if it was unknown.
    pub fn fail(&self, key: &str, error: CoreError) -> bool {
        match self.tickets.lock().remove(key) {
            Some(tracked) => tracked.ticket.fail(error),
            None => false,
        }
    }

    /// Stops tracking a ticket without settling it.
    pub fn forget(&self, key: &str) -> Option<Ticket> {
        self.tickets.lock().remove(key).map(|tracked| tracked.ticket)
    }

    /// Returns the number of writes still outstanding for `key`.
    pub fn outstanding(&self, key: &str) -> usize {
        self.tickets.lock().get(key).map_or(0, |tracked| tracked.outstanding)
    }

    /// Returns the number of tracked tickets.
    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Returns true if no ticket is tracked.
    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_guarded() {
        let ticket = Ticket::new();
        assert!(ticket.mark_enqueued());
        assert!(!ticket.mark_enqueued());
        assert!(ticket.confirm());
        assert!(!ticket.fail(CoreError::Closed));
        assert!(matches!(ticket.state(), TicketState::Confirmed));
    }

    #[test]
    fn failed_tickets_cannot_be_confirmed() {
        let ticket = Ticket::with_key("k", 1);
        assert!(ticket.fail(CoreError::Closed));
        assert!(!ticket.confirm());
        assert!(!ticket.mark_enqueued());
        assert!(ticket.is_settled());
    }

    #[tokio::test]
    async fn strict_wait_times_out_then_settles_later() {
        let ticket = Ticket::new();
        ticket.mark_enqueued();
        let err = ticket
            .wait_confirmed(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        assert!(ticket.confirm());
        ticket.wait_confirmed(Some(Duration::from_millis(20))).await.unwrap();
    }

    #[tokio::test]
    async fn wait_reports_failure() {
        let ticket = Ticket::new();
        let waiter = {
            let ticket = ticket.clone();
            tokio::spawn(async move { ticket.wait_confirmed(None).await })
        };
        tokio::task::yield_now().await;
        ticket.fail(CoreError::Rejected {
            reason: "nope".into(),
        });
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::Rejected { .. })));
    }

    #[test]
    fn registry_settles_once() {
        let registry = TicketRegistry::new();
        let ticket = Ticket::with_key("k1", 0);
        registry.register(&ticket);
        assert_eq!(registry.len(), 1);
        assert!(registry.confirm("k1"));
        assert!(!registry.confirm("k1"));
        assert!(registry.is_empty());
        assert!(matches!(ticket.state(), TicketState::Confirmed));
    }

    #[test]
    fn fanned_out_ticket_waits_for_every_write() {
        let registry = TicketRegistry::new();
        let ticket = Ticket::with_key("k2", 0);
        registry.register(&ticket);
        registry.register(&ticket);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.outstanding("k2"), 2);

        assert!(!registry.confirm("k2"));
        assert!(!ticket.is_settled());
        assert!(registry.confirm("k2"));
        assert!(matches!(ticket.state(), TicketState::Confirmed));
    }

    #[test]
    fn first_drop_fails_a_fanned_out_ticket() {
        let registry = TicketRegistry::new();
        let ticket = Ticket::with_key("k3", 0);
        registry.register(&ticket);
        registry.register(&ticket);

        assert!(!registry.confirm("k3"));
        assert!(registry.fail("k3", CoreError::Rejected { reason: "forbidden".into() }));
        assert!(matches!(ticket.state(), TicketState::Failed(CoreError::Rejected { .. })));
        assert!(!registry.confirm("k3"));
        assert!(registry.is_empty());
    }
}
