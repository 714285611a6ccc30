//! Mutation events and the per-collection event bus.
//!
//! Listeners are called synchronously, in registration order, after the
//! state change they describe. A panicking listener is logged and skipped;
//! it never aborts the pipeline. Channel subscribers receive a copy of every
//! event and are dropped once their receiver goes away.

use crate::error::CoreError;
use crate::operation::PersistMode;
use crate::persist::PersistStatus;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tidal_protocol::RemoteError;
use tracing::warn;

/// Something that happened to a collection's state.
#[derive(Debug, Clone)]
pub enum MutationEvent {
    /// A segment was planned. Its optimistic state is applied next.
    Planned {
        /// Collection name.
        collection: String,
        /// Segment sequence number.
        segment: u64,
        /// Ids changed by the optimistic state.
        changed_ids: Vec<String>,
        /// Number of write intents produced.
        intents: usize,
    },
    /// A segment was persisted and its writeback applied.
    Committed {
        /// Collection name.
        collection: String,
        /// Segment sequence number.
        segment: u64,
        /// Persistence strategy used.
        mode: PersistMode,
        /// Whether the authority already confirmed the writes.
        status: PersistStatus,
        /// Ids changed by the segment, including writeback.
        changed_ids: Vec<String>,
    },
    /// A segment failed and its optimistic state was reverted.
    RolledBack {
        /// Collection name.
        collection: String,
        /// Segment sequence number.
        segment: u64,
        /// Why the segment failed.
        error: CoreError,
    },
    /// Remote changes were applied.
    RemotePull {
        /// Collection name.
        collection: String,
        /// Ids changed by the remote changes.
        changed_ids: Vec<String>,
    },
    /// The authority acknowledged a queued write.
    RemoteAck {
        /// Collection name.
        collection: String,
        /// Confirmed entity id.
        entity_id: String,
        /// Version assigned by the authority.
        version: i64,
    },
    /// The authority rejected a queued write.
    RemoteReject {
        /// Collection name.
        collection: String,
        /// Target entity, if known.
        entity_id: Option<String>,
        /// The authority's error.
        error: RemoteError,
    },
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

/// Fan-out of mutation events.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    subscribers: RwLock<Vec<Sender<MutationEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback listener.
    pub fn listen(&self, listener: impl Fn(&MutationEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Returns a receiver of all future events.
    pub fn subscribe(&self) -> Receiver<MutationEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Delivers an event to every listener and subscriber.
    pub fn emit(&self, event: &MutationEvent) {
        // snapshot so listeners may (un)register while being called
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(event = ?event_name(event), "mutation listener panicked");
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of callback listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Runs a user callback, logging a panic instead of propagating it.
pub(crate) fn guarded(callback: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback, "user callback panicked");
    }
}

fn event_name(event: &MutationEvent) -> &'static str {
    match event {
        MutationEvent::Planned { .. } => "planned",
        MutationEvent::Committed { .. } => "committed",
        MutationEvent::RolledBack { .. } => "rolledBack",
        MutationEvent::RemotePull { .. } => "remotePull",
        MutationEvent::RemoteAck { .. } => "remoteAck",
        MutationEvent::RemoteReject { .. } => "remoteReject",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pull(ids: &[&str]) -> MutationEvent {
        MutationEvent::RemotePull {
            collection: "todos".into(),
            changed_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.listen(|_| panic!("listener bug"));
        let counter = Arc::clone(&seen);
        bus.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&pull(&["a"]));
        bus.emit(&pull(&["b"]));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unlisten_and_subscribe() {
        let bus = EventBus::new();
        let id = bus.listen(|_| {});
        assert!(bus.unlisten(id));
        assert!(!bus.unlisten(id));
        assert_eq!(bus.listener_count(), 0);

        let rx = bus.subscribe();
        bus.emit(&pull(&["x"]));
        match rx.try_recv().unwrap() {
            MutationEvent::RemotePull { changed_ids, .. } => assert_eq!(changed_ids, vec!["x"]),
            other => panic!("unexpected event {other:?}"),
        }

        drop(rx);
        bus.emit(&pull(&["y"]));
        assert!(bus.subscribers.read().is_empty());
    }
}
