//! Dispatch and persist middleware.

use crate::error::CoreResult;
use crate::operation::{Operation, PersistMode, TxKey};
use std::fmt;
use std::sync::Arc;
use tidal_protocol::WriteIntent;

/// What a dispatch middleware decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Continue with the (possibly rewritten) operation.
    Allow,
    /// Drop the operation. The reason is reported to the caller.
    Reject(String),
}

/// View of an operation about to be scheduled.
pub struct DispatchContext<'a> {
    /// Collection name.
    pub collection: &'a str,
    /// The operation. Middleware may rewrite it.
    pub operation: &'a mut Operation,
    /// Persistence strategy. Middleware may change it.
    pub persist: &'a mut PersistMode,
    /// Transaction key of the dispatch.
    pub tx: &'a TxKey,
    /// True if the caller chose `persist` explicitly.
    pub explicit_persist: bool,
    /// True if the collection has an outbox.
    pub outbox_configured: bool,
}

/// Hook run before an operation enters the scheduler queue.
pub trait BeforeDispatch: Send + Sync {
    /// Inspects, rewrites or rejects the operation.
    fn before_dispatch(&self, ctx: &mut DispatchContext<'_>) -> DispatchDecision;
}

/// Hook run on a segment's write intents before they are persisted.
pub trait BeforePersist: Send + Sync {
    /// Inspects or rewrites the intents. An error fails the segment.
    fn before_persist(
        &self,
        collection: &str,
        mode: PersistMode,
        intents: &mut Vec<WriteIntent>,
    ) -> CoreResult<()>;
}

/// Ordered middleware of a collection.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    dispatch: Vec<Arc<dyn BeforeDispatch>>,
    persist: Vec<Arc<dyn BeforePersist>>,
}

impl MiddlewareChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a dispatch hook.
    pub fn with_before_dispatch(mut self, hook: Arc<dyn BeforeDispatch>) -> Self {
        self.dispatch.push(hook);
        self
    }

    /// Inserts a dispatch hook ahead of the existing ones.
    pub fn prepend_before_dispatch(mut self, hook: Arc<dyn BeforeDispatch>) -> Self {
        self.dispatch.insert(0, hook);
        self
    }

    /// Appends a persist hook.
    pub fn with_before_persist(mut self, hook: Arc<dyn BeforePersist>) -> Self {
        self.persist.push(hook);
        self
    }

    /// Runs dispatch hooks in order. The first rejection wins.
    pub fn before_dispatch(&self, ctx: &mut DispatchContext<'_>) -> DispatchDecision {
        for hook in &self.dispatch {
            if let DispatchDecision::Reject(reason) = hook.before_dispatch(ctx) {
                return DispatchDecision::Reject(reason);
            }
        }
        DispatchDecision::Allow
    }

    /// Runs persist hooks in order. The first error wins.
    pub fn before_persist(
        &self,
        collection: &str,
        mode: PersistMode,
        intents: &mut Vec<WriteIntent>,
    ) -> CoreResult<()> {
        for hook in &self.persist {
            hook.before_persist(collection, mode, intents)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("before_dispatch", &self.dispatch.len())
            .field("before_persist", &self.persist.len())
            .finish()
    }
}

/// Routes writes of outbox-backed collections through the outbox.
///
/// Only dispatches that did not pick a persistence strategy are rerouted.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxInstaller;

impl BeforeDispatch for OutboxInstaller {
    fn before_dispatch(&self, ctx: &mut DispatchContext<'_>) -> DispatchDecision {
        if ctx.outbox_configured && !ctx.explicit_persist {
            *ctx.persist = PersistMode::Outbox;
        }
        DispatchDecision::Allow
    }
}
