//! The sync engine and its control surface.

use crate::config::{SyncConfig, SyncMode};
use crate::cursor::CursorStore;
use crate::error::{SyncError, SyncResult};
use crate::lock::SyncLock;
use crate::state::{PushReport, SyncCycleResult, SyncState, SyncStats, SyncStatus};
use crate::tasks;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tidal_core::{Collection, DurableStorage, OutboxQueue};
use tidal_protocol::{
    Change, ChangeBatch, Conflict, Cursor, OpOutput, PullRequest, RemoteAuthority, RemoteOp,
    RemoteOpResult,
};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hook receiving errors surfaced by pulls, pushes and subscriptions.
pub type ErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

struct Running {
    mode: SyncMode,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) config: SyncConfig,
    pub(crate) authority: Arc<dyn RemoteAuthority>,
    pub(crate) cursor: CursorStore,
    pub(crate) lock: SyncLock,
    collections: RwLock<Vec<Collection>>,
    state: RwLock<SyncState>,
    pub(crate) stats: RwLock<SyncStats>,
    pub(crate) conflicts: Mutex<Vec<Conflict>>,
    on_error: RwLock<Option<ErrorHook>>,
    running: Mutex<Option<Running>>,
    push_gate: tokio::sync::Mutex<()>,
    pull_gate: tokio::sync::Mutex<()>,
    pub(crate) wake: Notify,
}

impl EngineInner {
    pub(crate) fn collections(&self) -> Vec<Collection> {
        self.collections.read().clone()
    }

    fn collection_names(&self) -> Vec<String> {
        self.collections
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub(crate) fn outboxes(&self) -> Vec<(Collection, Arc<OutboxQueue>)> {
        self.collections
            .read()
            .iter()
            .filter_map(|c| c.outbox().map(|q| (c.clone(), Arc::clone(q))))
            .collect()
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn synced(&self) {
        self.set_state(SyncState::Synced);
        let mut stats = self.stats.write();
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
    }

    fn failed(&self, error: &SyncError) {
        self.set_state(SyncState::Error);
        self.report_error(error);
    }

    /// Records `error` and hands it to the `on_error` hook.
    pub(crate) fn report_error(&self, error: &SyncError) {
        warn!(error = %error, "sync error");
        self.stats.write().last_error = Some(error.to_string());
        let hook = self.on_error.read().clone();
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(|| hook(error))).is_err() {
                warn!("sync error hook panicked");
            }
        }
    }

    /// Runs remote operations under the request timeout.
    pub(crate) async fn execute(&self, ops: Vec<RemoteOp>) -> SyncResult<Vec<RemoteOpResult>> {
        match tokio::time::timeout(self.config.request_timeout, self.authority.execute(ops)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn execute_one(&self, op: RemoteOp) -> SyncResult<OpOutput> {
        let mut results = self.execute(vec![op]).await?;
        if results.len() != 1 {
            return Err(SyncError::Protocol(format!(
                "expected one result, got {}",
                results.len()
            )));
        }
        match results.pop() {
            Some(Ok(output)) => Ok(output),
            Some(Err(error)) => Err(SyncError::Remote(error)),
            None => Err(SyncError::Protocol("missing result".into())),
        }
    }

    /// Applies remote changes to every registered collection. Returns the
    /// number of entities that changed.
    fn apply_changes(&self, changes: &[Change]) -> u64 {
        if changes.is_empty() {
            return 0;
        }
        let applied: usize = self
            .collections()
            .iter()
            .map(|c| c.apply_remote_changes(changes).len())
            .sum();
        self.stats.write().changes_pulled += applied as u64;
        applied as u64
    }

    async fn pull_all(&self) -> SyncResult<u64> {
        let collections = self.collection_names();
        let mut applied = 0;
        loop {
            let cursor = self.cursor.get()?;
            let request = PullRequest::new(cursor.clone(), self.config.pull_batch_size)
                .with_collections(collections.clone());
            let response = match self.execute_one(RemoteOp::PullChanges(request)).await? {
                OpOutput::Changes(response) => response,
                _ => {
                    return Err(SyncError::Protocol(
                        "pull answered with a non-change output".into(),
                    ))
                }
            };

            applied += self.apply_changes(&response.changes);
            // the cursor only moves once the batch is applied
            if let Some(next) = response.next_cursor.as_ref() {
                self.cursor.advance(next)?;
            }
            debug!(
                changes = response.changes.len(),
                cursor = ?response.next_cursor,
                has_more = response.has_more,
                "pulled change batch"
            );

            let stalled = response.next_cursor.is_none() || response.next_cursor == cursor;
            if !response.has_more || stalled {
                break;
            }
        }
        Ok(applied)
    }

    pub(crate) async fn run_pull(&self) -> SyncResult<u64> {
        let _gate = self.pull_gate.lock().await;
        self.set_state(SyncState::Pulling);
        match self.pull_all().await {
            Ok(applied) => {
                self.synced();
                Ok(applied)
            }
            Err(err) => {
                self.failed(&err);
                Err(err)
            }
        }
    }

    /// Applies a batch delivered by a subscription and advances the cursor.
    pub(crate) async fn apply_batch(&self, batch: &ChangeBatch) -> SyncResult<u64> {
        let _gate = self.pull_gate.lock().await;
        let applied = self.apply_changes(&batch.changes);
        if let Some(cursor) = batch.cursor.as_ref() {
            self.cursor.advance(cursor)?;
        }
        Ok(applied)
    }

    pub(crate) async fn run_push(self: &Arc<Self>) -> SyncResult<PushReport> {
        let _gate = self.push_gate.lock().await;
        self.set_state(SyncState::Pushing);
        match self.push_all().await {
            Ok(report) => {
                // entries left behind are backing off
                if self.outboxes().iter().any(|(_, queue)| !queue.is_empty()) {
                    self.set_state(SyncState::RetryWait);
                } else {
                    self.synced();
                }
                Ok(report)
            }
            Err(err @ SyncError::LockHeld { .. }) => {
                debug!(error = %err, "skipping push");
                self.set_state(SyncState::RetryWait);
                Err(err)
            }
            Err(err) => {
                self.failed(&err);
                Err(err)
            }
        }
    }
}

/// Synchronises registered collections with a remote authority.
///
/// The engine owns the remote cursor and the sync lock of its scope. It can
/// be driven by hand with [`pull`](Self::pull), [`push`](Self::push) and
/// [`sync_once`](Self::sync_once), or run in the background with
/// [`start`](Self::start) until [`stop`](Self::stop).
///
/// # Example
///
/// ```rust,ignore
/// let engine = SyncEngine::new(SyncConfig::new("app"), authority, storage)
///     .with_collection(todos.clone());
/// engine.start(SyncMode::Full)?;
/// // ...
/// engine.stop().await;
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Creates an engine. Cursor and lock live in `storage` under the
    /// configured scope.
    pub fn new(
        config: SyncConfig,
        authority: Arc<dyn RemoteAuthority>,
        storage: Arc<dyn DurableStorage>,
    ) -> Self {
        let cursor = CursorStore::new(Arc::clone(&storage), config.cursor_key());
        let lock = SyncLock::new(storage, config.lock_key(), config.lock.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                authority,
                cursor,
                lock,
                collections: RwLock::new(Vec::new()),
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
                conflicts: Mutex::new(Vec::new()),
                on_error: RwLock::new(None),
                running: Mutex::new(None),
                push_gate: tokio::sync::Mutex::new(()),
                pull_gate: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
            }),
        }
    }

    /// Registers a collection and returns the engine.
    pub fn with_collection(self, collection: Collection) -> Self {
        self.register(collection);
        self
    }

    /// Registers a collection. A collection with the same name is replaced.
    ///
    /// If the engine is pushing in the background, enqueues to the
    /// collection's outbox wake the push loop from now on.
    pub fn register(&self, collection: Collection) {
        {
            let mut collections = self.inner.collections.write();
            collections.retain(|c| c.name() != collection.name());
            collections.push(collection.clone());
        }
        debug!(collection = collection.name(), "registered collection");

        let running = self.inner.running.lock();
        if let (Some(running), Some(queue), Ok(handle)) =
            (running.as_ref(), collection.outbox(), Handle::try_current())
        {
            if running.mode.pushes() {
                handle.spawn(tasks::forward_wakeups(
                    queue.notifier(),
                    Arc::clone(&self.inner),
                    running.shutdown.subscribe(),
                ));
            }
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Sets the hook called with every surfaced error.
    pub fn on_error(&self, hook: impl Fn(&SyncError) + Send + Sync + 'static) {
        *self.inner.on_error.write() = Some(Arc::new(hook));
    }

    /// Pulls all changes after the stored cursor. Returns the number of
    /// entities that changed.
    pub async fn pull(&self) -> SyncResult<u64> {
        self.inner.run_pull().await
    }

    /// Drains every registered outbox once.
    ///
    /// Fails with [`SyncError::LockHeld`] when another instance is pushing.
    pub async fn push(&self) -> SyncResult<PushReport> {
        self.inner.run_push().await
    }

    /// Pulls, then pushes.
    pub async fn sync_once(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        let pulled = self.pull().await?;
        let push = self.push().await?;
        self.inner.stats.write().cycles_completed += 1;
        Ok(SyncCycleResult {
            pulled,
            push,
            duration: start.elapsed(),
        })
    }

    /// Starts background loops for `mode`.
    ///
    /// Must be called within a Tokio runtime. Fails if the engine is
    /// already running.
    pub fn start(&self, mode: SyncMode) -> SyncResult<()> {
        let handle = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let mut running = self.inner.running.lock();
        if let Some(current) = running.as_ref() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("running {}", current.mode.as_str()),
                to: format!("start {}", mode.as_str()),
            });
        }

        let (shutdown, _) = watch::channel(false);
        let mut spawned = Vec::new();
        let pull_interval = self.inner.config.pull_interval_for(mode);

        if mode.pushes() {
            for (_, queue) in self.inner.outboxes() {
                spawned.push(handle.spawn(tasks::forward_wakeups(
                    queue.notifier(),
                    Arc::clone(&self.inner),
                    shutdown.subscribe(),
                )));
            }
            spawned.push(handle.spawn(tasks::push_loop(
                Arc::clone(&self.inner),
                shutdown.subscribe(),
            )));
        }
        if let Some(interval) = pull_interval {
            spawned.push(handle.spawn(tasks::pull_loop(
                Arc::clone(&self.inner),
                interval,
                shutdown.subscribe(),
            )));
        }
        if mode.subscribes() {
            let catch_up = mode.pulls() && pull_interval.is_none();
            spawned.push(handle.spawn(tasks::subscribe_loop(
                Arc::clone(&self.inner),
                catch_up,
                shutdown.subscribe(),
            )));
        }

        info!(mode = mode.as_str(), tasks = spawned.len(), "sync engine started");
        *running = Some(Running {
            mode,
            shutdown,
            tasks: spawned,
        });
        Ok(())
    }

    /// Stops background loops and waits for them to exit.
    ///
    /// A pull or push already talking to the authority is allowed to
    /// finish. Stopping an idle engine is a no-op.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        let Some(running) = running else {
            return;
        };
        // receivers treat a closed channel as a stop too
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("sync task panicked");
                }
            }
        }
        self.inner.set_state(SyncState::Idle);
        info!(mode = running.mode.as_str(), "sync engine stopped");
    }

    /// Returns true while background loops are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Returns the current state, counters and queue sizes.
    pub fn status(&self) -> SyncStatus {
        let (pending_writes, in_flight_writes) = self
            .inner
            .outboxes()
            .iter()
            .fold((0, 0), |(pending, in_flight), (_, queue)| {
                (pending + queue.len(), in_flight + queue.in_flight_count())
            });
        SyncStatus {
            state: *self.inner.state.read(),
            mode: self.inner.running.lock().as_ref().map(|r| r.mode),
            cursor: self.inner.cursor.get().ok().flatten(),
            pending_writes,
            in_flight_writes,
            lock_held: self.inner.lock.is_held().unwrap_or(false),
            unresolved_conflicts: self.inner.conflicts.lock().len(),
            stats: self.inner.stats.read().clone(),
        }
    }

    /// Returns the stored cursor.
    pub fn cursor(&self) -> SyncResult<Option<Cursor>> {
        self.inner.cursor.get()
    }

    /// Forgets the cursor, so the next pull starts from the beginning.
    pub fn reset_cursor(&self) -> SyncResult<()> {
        self.inner.cursor.reset()
    }

    /// Takes the conflicts left for the caller under the `manual` strategy.
    pub fn take_conflicts(&self) -> Vec<Conflict> {
        std::mem::take(&mut *self.inner.conflicts.lock())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("scope", &self.inner.config.scope)
            .field("state", &*self.inner.state.read())
            .field("collections", &self.inner.collection_names())
            .finish()
    }
}
