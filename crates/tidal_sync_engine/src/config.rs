//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use tidal_protocol::ConflictStrategy;

/// Which of push, pull and subscribe a running engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Periodic pulls only.
    PullOnly,
    /// Live change notifications only.
    SubscribeOnly,
    /// A catch-up pull, then live notifications.
    PullAndSubscribe,
    /// Outbox draining only.
    PushOnly,
    /// Outbox draining plus a catch-up pull and live notifications.
    Full,
}

impl SyncMode {
    /// Returns true if the mode drains outboxes.
    pub fn pushes(&self) -> bool {
        matches!(self, SyncMode::PushOnly | SyncMode::Full)
    }

    /// Returns true if the mode pulls changes.
    pub fn pulls(&self) -> bool {
        matches!(
            self,
            SyncMode::PullOnly | SyncMode::PullAndSubscribe | SyncMode::Full
        )
    }

    /// Returns true if the mode keeps a live subscription.
    pub fn subscribes(&self) -> bool {
        matches!(
            self,
            SyncMode::SubscribeOnly | SyncMode::PullAndSubscribe | SyncMode::Full
        )
    }

    /// Periodic pull interval used when the configuration sets none.
    ///
    /// Subscribe-driven modes only pull once on start.
    pub fn default_pull_interval(&self) -> Option<Duration> {
        match self {
            SyncMode::PullOnly => Some(Duration::from_secs(30)),
            _ => None,
        }
    }

    /// Returns the mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::PullOnly => "pull-only",
            SyncMode::SubscribeOnly => "subscribe-only",
            SyncMode::PullAndSubscribe => "pull+subscribe",
            SyncMode::PushOnly => "push-only",
            SyncMode::Full => "full",
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace of the cursor and lock keys in durable storage.
    pub scope: String,
    /// Maximum number of changes requested per pull.
    pub pull_batch_size: u32,
    /// Maximum number of outbox entries sent per push request.
    pub push_batch_size: usize,
    /// Periodic pull interval. Overrides the mode default when set.
    pub pull_interval: Option<Duration>,
    /// How often a running engine checks outboxes without a wake-up.
    pub push_interval: Duration,
    /// Deadline for a single authority call.
    pub request_timeout: Duration,
    /// Policy for `CONFLICT` rejects.
    pub conflict_strategy: ConflictStrategy,
    /// Retry configuration for rejected and failed pushes.
    pub retry: RetryConfig,
    /// Sync lock configuration.
    pub lock: LockConfig,
    /// Subscription configuration.
    pub subscribe: SubscribeConfig,
}

impl SyncConfig {
    /// Creates a configuration for `scope` with default values.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            pull_batch_size: 100,
            push_batch_size: 100,
            pull_interval: None,
            push_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            conflict_strategy: ConflictStrategy::ServerWins,
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            subscribe: SubscribeConfig::default(),
        }
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the periodic pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    /// Sets the push interval.
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the lock configuration.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the subscription configuration.
    pub fn with_subscribe(mut self, subscribe: SubscribeConfig) -> Self {
        self.subscribe = subscribe;
        self
    }

    /// Pull interval in effect for `mode`.
    pub fn pull_interval_for(&self, mode: SyncMode) -> Option<Duration> {
        if !mode.pulls() {
            return None;
        }
        self.pull_interval.or_else(|| mode.default_pull_interval())
    }

    pub(crate) fn cursor_key(&self) -> String {
        format!("sync:{}:cursor", self.scope)
    }

    pub(crate) fn lock_key(&self) -> String {
        format!("sync:{}:lock", self.scope)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per outbox entry.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Returns true once `attempts` failures exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for the cross-instance sync lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lock stays valid without renewal.
    pub ttl: Duration,
    /// How often a holder renews the lock while pushing.
    pub renew_interval: Duration,
    /// Identity of this engine instance.
    pub owner: String,
}

impl LockConfig {
    /// Creates a configuration with a fresh random owner id.
    pub fn new() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Sets the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the renewal interval.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Sets the owner id.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for live subscriptions.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// Wait before resubscribing after an error, close or idle timeout.
    pub reconnect_delay: Duration,
    /// Resubscribe when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
}

impl SubscribeConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Sets the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets or clears the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self::new()
    }
}
