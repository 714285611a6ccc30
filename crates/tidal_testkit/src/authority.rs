//! In-memory remote authority.
//!
//! Behaves like a small server of record: it versions entities, rejects
//! stale writes with `CONFLICT` and the current copy, replays the outcome of
//! an applied write for a repeated idempotency key, and records every change
//! in an ordered log that backs `changes.pull` and live subscriptions.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tidal_protocol::{
    Change, ChangeBatch, ChangeStream, CurrentSnapshot, Cursor, OpOutput, PullRequest,
    PullResponse, RemoteAuthority, RemoteError, RemoteOp, RemoteOpResult, SubscribeRequest,
    TransportError, WriteAction, WriteItem, WriteItemOutcome, WriteOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Error code for writes to an entity that does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Error code for creates of an id that already exists.
pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";

/// How created entities get their id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdAssignment {
    /// Keep the client id when one is sent.
    #[default]
    PreferClient,
    /// Always assign `s1`, `s2`, ...
    Server,
}

#[derive(Debug, Clone)]
struct Stored {
    version: i64,
    value: Value,
}

struct Subscriber {
    collections: Vec<String>,
    tx: mpsc::Sender<Result<ChangeBatch, TransportError>>,
}

#[derive(Default)]
struct ServerState {
    collections: HashMap<String, BTreeMap<String, Stored>>,
    log: Vec<Change>,
    replay: HashMap<String, WriteItemOutcome>,
    next_id: u64,
    failures: VecDeque<TransportError>,
    forced_rejects: HashMap<String, RemoteError>,
    subscribers: Vec<Subscriber>,
    offline: bool,
    latency: Option<Duration>,
}

/// A versioned, in-memory server of record.
pub struct MemoryAuthority {
    state: Mutex<ServerState>,
    ids: IdAssignment,
    calls: AtomicUsize,
    items: AtomicUsize,
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthority {
    /// Creates an empty authority that keeps client ids.
    pub fn new() -> Self {
        Self::with_ids(IdAssignment::PreferClient)
    }

    /// Creates an empty authority that assigns every created id itself.
    pub fn with_server_ids() -> Self {
        Self::with_ids(IdAssignment::Server)
    }

    /// Creates an empty authority with the given id policy.
    pub fn with_ids(ids: IdAssignment) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            ids,
            calls: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
        }
    }

    /// Number of `execute` calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of write items received, including replays.
    pub fn write_item_count(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }

    /// Fails the next `count` calls with a transport error.
    pub fn fail_next(&self, count: usize, retryable: bool) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.failures.push_back(TransportError {
                message: "injected transport failure".into(),
                retryable,
            });
        }
    }

    /// Fails every call until `set_offline(false)`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Rejects the next write to `entity_id` with `error`.
    pub fn reject_next(&self, entity_id: impl Into<String>, error: RemoteError) {
        self.state.lock().forced_rejects.insert(entity_id.into(), error);
    }

    /// Closes every live subscription, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Returns the stored value of an entity.
    pub fn entity(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|s| s.value.clone())
    }

    /// Returns the stored version of an entity.
    pub fn version(&self, collection: &str, id: &str) -> Option<i64> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|s| s.version)
    }

    /// Number of entities stored in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if `collection` holds no entities.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Number of changes recorded in the log.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Writes an entity as another client would: bumps its version, logs
    /// the change and notifies subscribers. Returns the new version.
    pub fn server_write(&self, collection: &str, value: Value) -> i64 {
        let mut state = self.state.lock();
        let id = match value.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                format!("s{}", state.next_id)
            }
        };
        let version = state
            .collections
            .get(collection)
            .and_then(|c| c.get(&id))
            .map_or(1, |s| s.version + 1);
        let fields = match value {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        store(&mut state, collection, &id, version, fields);
        version
    }

    /// Deletes an entity as another client would.
    pub fn server_delete(&self, collection: &str, id: &str) {
        let mut state = self.state.lock();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        if let Some(removed) = removed {
            record(
                &mut state,
                Change::Delete {
                    collection: collection.to_string(),
                    entity_id: id.to_string(),
                    version: Some(removed.version + 1),
                },
            );
        }
    }

    fn begin_call(&self) -> Result<Option<Duration>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.offline {
            return Err(TransportError::retryable("authority is offline"));
        }
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure);
        }
        Ok(state.latency)
    }

    fn run(&self, op: RemoteOp) -> RemoteOpResult {
        let mut state = self.state.lock();
        match op {
            RemoteOp::Query { collection, ids } => {
                let stored = state.collections.get(&collection);
                let entities = match (stored, ids) {
                    (None, _) => Vec::new(),
                    (Some(c), None) => c.values().map(|s| s.value.clone()).collect(),
                    (Some(c), Some(ids)) => ids
                        .iter()
                        .filter_map(|id| c.get(id))
                        .map(|s| s.value.clone())
                        .collect(),
                };
                Ok(OpOutput::Query { entities })
            }
            RemoteOp::Write {
                collection,
                action,
                options,
                items,
            } => {
                self.items.fetch_add(items.len(), Ordering::SeqCst);
                let outcomes = items
                    .into_iter()
                    .map(|item| self.write(&mut state, &collection, action, options, item))
                    .collect();
                Ok(OpOutput::Write { outcomes })
            }
            RemoteOp::PullChanges(request) => pull(&state, &request).map(OpOutput::Changes),
        }
    }

    fn write(
        &self,
        state: &mut ServerState,
        collection: &str,
        action: WriteAction,
        options: WriteOptions,
        item: WriteItem,
    ) -> WriteItemOutcome {
        let key = item.meta.idempotency_key.clone();
        if let Some(previous) = state.replay.get(&key) {
            debug!(collection, key = %key, "replaying write outcome");
            return previous.clone();
        }
        let outcome = self.apply(state, collection, action, options, item);
        // rejects are not remembered, so a retry is evaluated afresh
        if matches!(outcome, WriteItemOutcome::Ok(_)) {
            state.replay.insert(key, outcome.clone());
        }
        outcome
    }

    fn apply(
        &self,
        state: &mut ServerState,
        collection: &str,
        action: WriteAction,
        options: WriteOptions,
        item: WriteItem,
    ) -> WriteItemOutcome {
        if let Some(forced) = item
            .entity_id
            .as_ref()
            .and_then(|id| state.forced_rejects.remove(id))
        {
            let current = item
                .entity_id
                .as_deref()
                .and_then(|id| snapshot(state, collection, id));
            return WriteItemOutcome::rejected(forced, current);
        }

        let fields = match item.value {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        let existing = item
            .entity_id
            .as_deref()
            .and_then(|id| state.collections.get(collection).and_then(|c| c.get(id)))
            .cloned();

        match action {
            WriteAction::Create => {
                let id = match (self.ids, item.entity_id) {
                    (IdAssignment::PreferClient, Some(id)) => {
                        if existing.is_some() {
                            return WriteItemOutcome::rejected(
                                RemoteError::new(ALREADY_EXISTS, format!("{id} already exists")),
                                None,
                            );
                        }
                        id
                    }
                    _ => {
                        state.next_id += 1;
                        format!("s{}", state.next_id)
                    }
                };
                ack(store(state, collection, &id, 1, fields))
            }
            WriteAction::Update | WriteAction::Upsert | WriteAction::Delete => {
                let Some(id) = item.entity_id else {
                    return WriteItemOutcome::rejected(
                        RemoteError::new("INVALID", "write without entity id"),
                        None,
                    );
                };
                if let (Some(stored), Some(base)) = (&existing, item.base_version) {
                    if stored.version != base {
                        return WriteItemOutcome::rejected(
                            RemoteError::conflict(format!(
                                "{id} is at version {}, write expected {base}",
                                stored.version
                            )),
                            Some(CurrentSnapshot {
                                version: Some(stored.version),
                                value: Some(stored.value.clone()),
                            }),
                        );
                    }
                }
                if existing.is_none() && action != WriteAction::Upsert {
                    return WriteItemOutcome::rejected(
                        RemoteError::new(NOT_FOUND, format!("{id} does not exist")),
                        Some(CurrentSnapshot {
                            version: None,
                            value: None,
                        }),
                    );
                }
                let version = existing.as_ref().map_or(1, |s| s.version + 1);

                match action {
                    WriteAction::Delete if !options.soft_delete => {
                        if let Some(c) = state.collections.get_mut(collection) {
                            c.remove(&id);
                        }
                        record(
                            state,
                            Change::Delete {
                                collection: collection.to_string(),
                                entity_id: id.clone(),
                                version: Some(version),
                            },
                        );
                        WriteItemOutcome::ok(id, version, None)
                    }
                    WriteAction::Delete => {
                        let mut merged = existing.map(|s| into_fields(s.value)).unwrap_or_default();
                        merged.extend(fields);
                        merged.insert("deleted".into(), Value::Bool(true));
                        ack(store(state, collection, &id, version, merged))
                    }
                    WriteAction::Upsert if options.replace => {
                        ack(store(state, collection, &id, version, fields))
                    }
                    _ => {
                        let mut merged = existing.map(|s| into_fields(s.value)).unwrap_or_default();
                        merged.extend(fields);
                        ack(store(state, collection, &id, version, merged))
                    }
                }
            }
        }
    }
}

fn into_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

fn snapshot(state: &ServerState, collection: &str, id: &str) -> Option<CurrentSnapshot> {
    state
        .collections
        .get(collection)
        .and_then(|c| c.get(id))
        .map(|s| CurrentSnapshot {
            version: Some(s.version),
            value: Some(s.value.clone()),
        })
}

fn ack(stored: Stored) -> WriteItemOutcome {
    let id = stored
        .value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    WriteItemOutcome::ok(id, stored.version, Some(stored.value))
}

/// Stores an entity, logs the change and returns the stored copy.
fn store(
    state: &mut ServerState,
    collection: &str,
    id: &str,
    version: i64,
    mut fields: Map<String, Value>,
) -> Stored {
    fields.insert("id".into(), Value::String(id.to_string()));
    fields.insert("version".into(), Value::from(version));
    let stored = Stored {
        version,
        value: Value::Object(fields),
    };
    state
        .collections
        .entry(collection.to_string())
        .or_default()
        .insert(id.to_string(), stored.clone());
    record(
        state,
        Change::Upsert {
            collection: collection.to_string(),
            value: stored.value.clone(),
        },
    );
    stored
}

/// Appends a change to the log and pushes it to interested subscribers.
fn record(state: &mut ServerState, change: Change) {
    state.log.push(change.clone());
    let cursor = Cursor::new(state.log.len().to_string());
    state.subscribers.retain(|subscriber| {
        if !subscriber.collections.is_empty()
            && !subscriber
                .collections
                .iter()
                .any(|c| c == change.collection())
        {
            return !subscriber.tx.is_closed();
        }
        let batch = ChangeBatch {
            changes: vec![change.clone()],
            cursor: Some(cursor.clone()),
        };
        subscriber.tx.try_send(Ok(batch)).is_ok()
    });
}

fn pull(state: &ServerState, request: &PullRequest) -> Result<PullResponse, RemoteError> {
    let start = match &request.cursor {
        Some(cursor) => cursor
            .as_str()
            .parse::<usize>()
            .map_err(|_| RemoteError::new("INVALID_CURSOR", format!("bad cursor {cursor}")))?,
        None => 0,
    };
    let limit = request.limit.max(1) as usize;
    let mut changes = Vec::new();
    let mut position = start.min(state.log.len());
    for change in state.log.iter().skip(position) {
        if changes.len() >= limit {
            break;
        }
        position += 1;
        if request.collections.is_empty()
            || request.collections.iter().any(|c| c == change.collection())
        {
            changes.push(change.clone());
        }
    }
    trace!(start, position, changes = changes.len(), "served pull");
    Ok(PullResponse::new(
        changes,
        Some(Cursor::new(position.to_string())),
        position < state.log.len(),
    ))
}

#[async_trait]
impl RemoteAuthority for MemoryAuthority {
    async fn execute(&self, ops: Vec<RemoteOp>) -> Result<Vec<RemoteOpResult>, TransportError> {
        if let Some(latency) = self.begin_call()? {
            tokio::time::sleep(latency).await;
        }
        Ok(ops.into_iter().map(|op| self.run(op)).collect())
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<ChangeStream, TransportError> {
        self.begin_call()?;
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock();
        if let Some(cursor) = &request.cursor {
            let backlog = pull(
                &state,
                &PullRequest::new(Some(cursor.clone()), u32::MAX).with_collections(request.collections.clone()),
            )
            .map_err(|e| TransportError::fatal(e.to_string()))?;
            if !backlog.changes.is_empty() {
                let batch = ChangeBatch {
                    changes: backlog.changes,
                    cursor: backlog.next_cursor,
                };
                // fresh channel with spare capacity
                let _ = tx.try_send(Ok(batch));
            }
        }
        state.subscribers.push(Subscriber {
            collections: request.collections,
            tx,
        });
        debug!(subscribers = state.subscribers.len(), "subscription opened");
        Ok(rx)
    }
}
