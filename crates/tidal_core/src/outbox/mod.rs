//! Durable outbox of write intents awaiting the remote authority.

mod queue;

pub use queue::{EnqueueReport, OutboxEntry, OutboxQueue};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Visibility of an outbox write before it reaches the authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Only the optimistic cache reflects the write until it is replayed.
    #[default]
    Queue,
    /// The write is also executed against the local authority before it
    /// is queued.
    LocalFirst,
}

/// Callback receiving entries evicted by the size bound.
pub type OnQueueFull = Arc<dyn Fn(&OutboxEntry) + Send + Sync>;

/// Outbox configuration.
#[derive(Clone)]
pub struct OutboxConfig {
    /// Maximum number of queued entries. The oldest entry is evicted first.
    pub max_size: usize,
    /// In-flight entries older than this are reclaimed for resending.
    pub in_flight_timeout: Duration,
    /// Write visibility mode.
    pub write_mode: WriteMode,
    /// Storage key. Defaults to `outbox:<collection>`.
    pub storage_key: Option<String>,
    /// Called once per evicted entry.
    pub on_queue_full: Option<OnQueueFull>,
}

impl OutboxConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_size: 1000,
            in_flight_timeout: Duration::from_secs(30),
            write_mode: WriteMode::Queue,
            storage_key: None,
            on_queue_full: None,
        }
    }

    /// Sets the maximum queue size (at least 1).
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Sets the in-flight timeout.
    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }

    /// Sets the write mode.
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Sets the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    /// Sets the eviction callback.
    pub fn on_queue_full(mut self, f: impl Fn(&OutboxEntry) + Send + Sync + 'static) -> Self {
        self.on_queue_full = Some(Arc::new(f));
        self
    }

    pub(crate) fn key_for(&self, collection: &str) -> String {
        self.storage_key
            .clone()
            .unwrap_or_else(|| format!("outbox:{collection}"))
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OutboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxConfig")
            .field("max_size", &self.max_size)
            .field("in_flight_timeout", &self.in_flight_timeout)
            .field("write_mode", &self.write_mode)
            .field("storage_key", &self.storage_key)
            .field("on_queue_full", &self.on_queue_full.is_some())
            .finish()
    }
}
