//! Collection configuration.

use crate::operation::{Completion, PersistMode};
use std::time::Duration;

/// Configuration of a collection.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Collection name. Also names the outbox storage key.
    pub name: String,

    /// Persistence strategy for dispatches that do not pick one.
    pub default_persist: PersistMode,

    /// Completion mode for dispatches that do not pick one.
    pub completion: Completion,

    /// Deadline for direct authority calls (`None` = wait indefinitely).
    pub request_timeout: Option<Duration>,
}

impl CollectionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_persist: PersistMode::Direct,
            completion: Completion::Optimistic,
            request_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Sets the default persistence strategy.
    #[must_use]
    pub fn with_default_persist(mut self, mode: PersistMode) -> Self {
        self.default_persist = mode;
        self
    }

    /// Sets the default completion mode.
    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Sets the direct request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}
