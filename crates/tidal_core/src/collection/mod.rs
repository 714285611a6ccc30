//! Collection handles.
//!
//! A [`Collection`] owns one reactive entity map and the pipeline that
//! mutates it. Handles are cheap to clone and are passed explicitly to
//! whatever needs them (sync engine, UI bindings); there is no global
//! registry.
//!
//! # Usage
//!
//! ```rust,ignore
//! let todos = Collection::builder("todos")
//!     .remote(authority)
//!     .build()?;
//!
//! // visible immediately, confirmed once the authority answers
//! let todo = todos.add_one(json!({"title": "write docs"})).await?;
//! ```

mod executor;
mod scheduler;

use crate::config::CollectionConfig;
use crate::entity::{DraftResult, Entity, EntityMap, Patch};
use crate::error::{CoreError, CoreResult};
use crate::events::{guarded, EventBus, MutationEvent};
use crate::middleware::{DispatchContext, DispatchDecision, MiddlewareChain, OutboxInstaller};
use crate::operation::{Completion, DispatchOptions, DispatchOutcome, OpContext, Operation};
use crate::outbox::{OutboxConfig, OutboxQueue};
use crate::persist::{execute_with_timeout, DirectPersister, OutboxPersister};
use crate::storage::DurableStorage;
use crate::ticket::{Ticket, TicketRegistry};
use crate::writeback;
use parking_lot::Mutex;
use scheduler::{PendingOp, Scheduler};
use serde_json::Value;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidal_protocol::{
    Change, CurrentSnapshot, OpOutput, RemoteAuthority, RemoteOp, TransportError, WriteAck,
    WriteIntent, WriteReject,
};
use tokio::sync::{oneshot, watch};
use tracing::debug;

pub(crate) struct CollectionInner {
    config: CollectionConfig,
    state: watch::Sender<EntityMap>,
    commit_lock: Mutex<()>,
    remote: Option<Arc<dyn RemoteAuthority>>,
    direct: Option<DirectPersister>,
    outbox: Option<OutboxPersister>,
    tickets: Arc<TicketRegistry>,
    middleware: MiddlewareChain,
    events: EventBus,
    scheduler: Scheduler,
    segments: AtomicU64,
}

impl CollectionInner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn snapshot(&self) -> EntityMap {
        self.state.borrow().clone()
    }

    fn next_segment(&self) -> u64 {
        self.segments.fetch_add(1, Ordering::Relaxed)
    }

    /// Reads the current map and optionally replaces it, atomically with
    /// respect to every other state transition of the collection.
    fn transact<R>(&self, f: impl FnOnce(&EntityMap) -> (Option<EntityMap>, R)) -> R {
        let _guard = self.commit_lock.lock();
        let current = self.snapshot();
        let (next, result) = f(&current);
        if let Some(next) = next {
            if !next.ptr_eq(&current) {
                self.state.send_replace(next);
            }
        }
        result
    }

    /// Applies a draft built from the current map; returns the changed ids.
    fn commit(&self, f: impl FnOnce(&EntityMap) -> DraftResult) -> Vec<String> {
        self.transact(|current| {
            let result = f(current);
            (Some(result.map), result.changed_ids)
        })
    }
}

/// Handle on a collection's entity map and mutation pipeline.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Starts building a collection.
    pub fn builder(name: impl Into<String>) -> CollectionBuilder {
        CollectionBuilder::new(CollectionConfig::new(name))
    }

    /// Returns the collection name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> EntityMap {
        self.inner.snapshot()
    }

    /// Returns the cached entity with the given id.
    pub fn get(&self, id: &str) -> Option<Arc<Entity>> {
        self.inner.state.borrow().get(id).cloned()
    }

    /// Returns a receiver notified on every committed map change.
    pub fn watch(&self) -> watch::Receiver<EntityMap> {
        self.inner.state.subscribe()
    }

    /// Returns the event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Returns the outbox, if configured.
    pub fn outbox(&self) -> Option<&Arc<OutboxQueue>> {
        self.inner.outbox.as_ref().map(OutboxPersister::queue)
    }

    /// Returns the tickets of queued writes.
    pub fn tickets(&self) -> &Arc<TicketRegistry> {
        &self.inner.tickets
    }

    /// Returns the remote authority, if configured.
    pub fn remote(&self) -> Option<&Arc<dyn RemoteAuthority>> {
        self.inner.remote.as_ref()
    }

    /// Dispatches an operation.
    ///
    /// The operation is queued immediately, so dispatch order is application
    /// order even if the returned futures are awaited out of order. Must be
    /// called from within a Tokio runtime.
    pub fn dispatch(&self, operation: Operation, options: DispatchOptions) -> Dispatched {
        let DispatchOptions {
            persist,
            tx,
            ticket,
            op_context,
            completion,
            on_success,
            on_fail,
        } = options;
        let ticket = ticket.unwrap_or_default();
        let completion = completion.unwrap_or(self.inner.config.completion);
        let mut operation = operation;
        let mut mode = persist.unwrap_or(self.inner.config.default_persist);

        let decision = {
            let mut ctx = DispatchContext {
                collection: self.name(),
                operation: &mut operation,
                persist: &mut mode,
                tx: &tx,
                explicit_persist: persist.is_some(),
                outbox_configured: self.inner.outbox.is_some(),
            };
            self.inner.middleware.before_dispatch(&mut ctx)
        };
        if let DispatchDecision::Reject(reason) = decision {
            debug!(collection = self.name(), %reason, "dispatch rejected by middleware");
            let err = CoreError::Rejected { reason };
            if let Some(on_fail) = on_fail {
                guarded("on_fail", || on_fail(&err));
            }
            return Dispatched::failed(ticket, completion, err);
        }

        let (done, rx) = oneshot::channel();
        let pending = PendingOp {
            operation,
            persist: mode,
            tx,
            ticket: ticket.clone(),
            op_context,
            on_success,
            on_fail,
            done,
        };
        if let Err(pending) = scheduler::enqueue(&self.inner, pending) {
            pending.fail(CoreError::config("dispatch requires a Tokio runtime"));
        }
        Dispatched {
            ticket,
            completion,
            state: DispatchedState::Waiting(rx),
        }
    }

    fn dispatch_value(
        &self,
        value: Value,
        make: impl FnOnce(Entity) -> Operation,
    ) -> Dispatched {
        match Entity::from_value(value) {
            Ok(entity) => self.dispatch(make(entity), DispatchOptions::new()),
            Err(err) => Dispatched::failed(Ticket::new(), self.inner.config.completion, err),
        }
    }

    /// Adds an entity under its own id, or a temp id if it has none.
    pub fn add_one(&self, value: Value) -> Dispatched {
        self.dispatch_value(value, Operation::Add)
    }

    /// Creates an entity whose id the authority assigns.
    pub fn create_one(&self, value: Value) -> Dispatched {
        self.dispatch_value(value, Operation::Create)
    }

    /// Merges `changes` into an existing entity.
    pub fn update_one(&self, id: impl Into<String>, changes: Value) -> Dispatched {
        match changes {
            Value::Object(changes) => self.dispatch(
                Operation::Update {
                    id: id.into(),
                    changes,
                },
                DispatchOptions::new(),
            ),
            other => Dispatched::failed(
                Ticket::new(),
                self.inner.config.completion,
                CoreError::invalid_entity(format!("update changes must be an object, got {other}")),
            ),
        }
    }

    /// Inserts an entity, merging into an existing one when `merge` is set
    /// and replacing it otherwise.
    pub fn upsert_one(&self, value: Value, merge: bool) -> Dispatched {
        self.dispatch_value(value, |value| Operation::Upsert { value, merge })
    }

    /// Soft-deletes an entity.
    pub fn remove_one(&self, id: impl Into<String>) -> Dispatched {
        self.dispatch(Operation::Remove { id: id.into() }, DispatchOptions::new())
    }

    /// Hard-deletes an entity.
    pub fn force_remove_one(&self, id: impl Into<String>) -> Dispatched {
        self.dispatch(Operation::ForceRemove { id: id.into() }, DispatchOptions::new())
    }

    /// Seeds an entity into the cache without persisting it.
    pub fn hydrate(&self, value: Value) -> Dispatched {
        self.dispatch_value(value, Operation::Hydrate)
    }

    /// Seeds entities into the cache without persisting them.
    pub fn hydrate_many(&self, values: Vec<Value>) -> Dispatched {
        match values
            .into_iter()
            .map(Entity::from_value)
            .collect::<CoreResult<Vec<_>>>()
        {
            Ok(entities) => self.dispatch(Operation::HydrateMany(entities), DispatchOptions::new()),
            Err(err) => Dispatched::failed(Ticket::new(), self.inner.config.completion, err),
        }
    }

    /// Replays a structural diff, reporting patches back to `context`'s
    /// owner instead of invoking success callbacks.
    pub fn apply_patches(&self, patches: Vec<Patch>, inverse: Vec<Patch>, context: OpContext) -> Dispatched {
        self.dispatch(
            Operation::Patches { patches, inverse },
            DispatchOptions::new().with_op_context(context),
        )
    }

    /// Reads entities from the authority and hydrates them.
    ///
    /// `ids` restricts the query; `None` reads the whole collection. Cached
    /// entities are not overwritten. Returns the cached entities for every
    /// id the authority returned.
    pub async fn fetch(&self, ids: Option<Vec<String>>) -> CoreResult<Vec<Arc<Entity>>> {
        let remote = self.inner.remote.as_ref().ok_or_else(|| CoreError::NoRemote {
            collection: self.name().to_string(),
        })?;
        let query = RemoteOp::Query {
            collection: self.name().to_string(),
            ids,
        };
        let results =
            execute_with_timeout(remote.as_ref(), vec![query], self.inner.config.request_timeout).await?;
        let values = match results.into_iter().next() {
            Some(Ok(OpOutput::Query { entities })) => entities,
            Some(Err(error)) => return Err(CoreError::persistence(error, None)),
            Some(Ok(_)) | None => {
                return Err(TransportError::fatal("authority answered a query with an unexpected output").into())
            }
        };

        let entities = values
            .into_iter()
            .map(Entity::from_value)
            .collect::<CoreResult<Vec<_>>>()?;
        let ids: Vec<String> = entities
            .iter()
            .filter_map(|e| e.id().map(String::from))
            .collect();
        self.dispatch(Operation::HydrateMany(entities), DispatchOptions::new())
            .await?;

        let snapshot = self.snapshot();
        Ok(ids.iter().filter_map(|id| snapshot.get(id).cloned()).collect())
    }

    /// Intents still waiting in the outbox, oldest first.
    fn queued_intents(&self) -> Vec<WriteIntent> {
        self.outbox()
            .map(|queue| queue.entries().into_iter().map(|entry| entry.intent).collect())
            .unwrap_or_default()
    }

    /// Applies remote changes (pulled or pushed). Returns the changed ids.
    ///
    /// Entities with queued writes keep those writes applied on top of the
    /// incoming data.
    pub fn apply_remote_changes(&self, changes: &[Change]) -> Vec<String> {
        let name = self.name().to_string();
        let queued = self.queued_intents();
        let changed = self
            .inner
            .commit(|current| writeback::apply_changes(current, &name, changes, &queued));
        if !changed.is_empty() {
            debug!(collection = %name, changed = changed.len(), "applied remote changes");
            self.inner.events.emit(&MutationEvent::RemotePull {
                collection: name,
                changed_ids: changed.clone(),
            });
        }
        changed
    }

    /// Applies the authority's acknowledgement of a queued write and
    /// records it against its ticket.
    ///
    /// The acknowledged entry must already be off the queue; writes still
    /// queued for the same entity are re-applied over the returned data.
    pub fn apply_remote_ack(&self, intent: &WriteIntent, ack: &WriteAck, ticket_key: &str) {
        let queued = self.queued_intents();
        self.inner
            .commit(|current| writeback::apply_ack(current, intent, ack, &queued));
        self.inner.tickets.confirm(ticket_key);
        self.inner.events.emit(&MutationEvent::RemoteAck {
            collection: self.name().to_string(),
            entity_id: ack.entity_id.clone(),
            version: ack.version,
        });
    }

    /// Replaces a cached entity with the authority's copy.
    pub fn apply_server_copy(&self, entity_id: &str, snapshot: &CurrentSnapshot) -> Vec<String> {
        let changed = self
            .inner
            .commit(|current| writeback::apply_server_copy(current, entity_id, snapshot));
        if !changed.is_empty() {
            self.inner.events.emit(&MutationEvent::RemotePull {
                collection: self.name().to_string(),
                changed_ids: changed.clone(),
            });
        }
        changed
    }

    /// Reports a rejected queued write to listeners.
    pub fn report_remote_reject(&self, intent: &WriteIntent, reject: &WriteReject) {
        self.inner.events.emit(&MutationEvent::RemoteReject {
            collection: self.name().to_string(),
            entity_id: intent.entity_id().map(String::from),
            error: reject.error.clone(),
        });
    }

    /// Fails the ticket of a queued write that will not be retried.
    pub fn fail_remote_write(&self, ticket_key: &str, error: CoreError) -> bool {
        self.inner.tickets.fail(ticket_key, error)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name())
            .field("entities", &self.inner.state.borrow().len())
            .field("outbox", &self.outbox().map(|q| q.len()))
            .finish()
    }
}

/// Builder for [`Collection`].
pub struct CollectionBuilder {
    config: CollectionConfig,
    remote: Option<Arc<dyn RemoteAuthority>>,
    local: Option<Arc<dyn RemoteAuthority>>,
    outbox: Option<(Arc<dyn DurableStorage>, OutboxConfig)>,
    middleware: MiddlewareChain,
}

impl CollectionBuilder {
    /// Creates a builder from a configuration.
    pub fn new(config: CollectionConfig) -> Self {
        Self {
            config,
            remote: None,
            local: None,
            outbox: None,
            middleware: MiddlewareChain::new(),
        }
    }

    /// Replaces the configuration, keeping the name.
    pub fn config(mut self, config: CollectionConfig) -> Self {
        let name = std::mem::take(&mut self.config.name);
        self.config = CollectionConfig { name, ..config };
        self
    }

    /// Sets the remote authority used by direct persistence and `fetch`.
    pub fn remote(mut self, authority: Arc<dyn RemoteAuthority>) -> Self {
        self.remote = Some(authority);
        self
    }

    /// Sets the local authority used by local-first outboxes.
    pub fn local_authority(mut self, authority: Arc<dyn RemoteAuthority>) -> Self {
        self.local = Some(authority);
        self
    }

    /// Attaches a durable outbox. Dispatches without an explicit persist
    /// mode are routed to it.
    pub fn outbox(mut self, storage: Arc<dyn DurableStorage>, config: OutboxConfig) -> Self {
        self.outbox = Some((storage, config));
        self
    }

    /// Sets the middleware chain.
    pub fn middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    /// Builds the collection, restoring its outbox from storage.
    pub fn build(self) -> CoreResult<Collection> {
        let tickets = Arc::new(TicketRegistry::new());
        let direct = self.remote.clone().map(|remote| {
            let persister = DirectPersister::new(remote);
            match self.config.request_timeout {
                Some(timeout) => persister.with_timeout(timeout),
                None => persister,
            }
        });

        let mut middleware = self.middleware;
        let outbox = match self.outbox {
            Some((storage, config)) => {
                let queue = Arc::new(OutboxQueue::open(self.config.name.clone(), storage, config)?);
                let local = self.local.map(DirectPersister::new);
                middleware = middleware.prepend_before_dispatch(Arc::new(OutboxInstaller));
                Some(OutboxPersister::new(queue, local, Arc::clone(&tickets))?)
            }
            None => None,
        };

        let (state, _) = watch::channel(EntityMap::new());
        Ok(Collection {
            inner: Arc::new(CollectionInner {
                config: self.config,
                state,
                commit_lock: Mutex::new(()),
                remote: self.remote,
                direct,
                outbox,
                tickets,
                middleware,
                events: EventBus::new(),
                scheduler: Scheduler::default(),
                segments: AtomicU64::new(0),
            }),
        })
    }
}

enum DispatchedState {
    Waiting(oneshot::Receiver<CoreResult<DispatchOutcome>>),
    Failed(CoreError),
}

/// A dispatched operation. Await it for the outcome.
///
/// Under [`Completion::Strict`] the outcome is only returned once the
/// authority confirmed the write, or [`CoreError::Timeout`] once the
/// deadline passed; the write itself keeps going and settles its ticket
/// later.
#[must_use = "a dispatched operation runs regardless; await it to observe the outcome"]
pub struct Dispatched {
    ticket: Ticket,
    completion: Completion,
    state: DispatchedState,
}

impl Dispatched {
    fn failed(ticket: Ticket, completion: Completion, err: CoreError) -> Self {
        ticket.fail(err.clone());
        Self {
            ticket,
            completion,
            state: DispatchedState::Failed(err),
        }
    }

    /// Returns the operation's ticket.
    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    /// Waits for the outcome.
    pub async fn outcome(self) -> CoreResult<DispatchOutcome> {
        let outcome = match self.state {
            DispatchedState::Waiting(rx) => rx.await.map_err(|_| CoreError::Closed)??,
            DispatchedState::Failed(err) => return Err(err),
        };
        if let Completion::Strict { timeout } = self.completion {
            self.ticket.wait_confirmed(Some(timeout)).await?;
        }
        Ok(outcome)
    }
}

impl IntoFuture for Dispatched {
    type Output = CoreResult<DispatchOutcome>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.outcome())
    }
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("ticket", &self.ticket)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}
