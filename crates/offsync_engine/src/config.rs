//! Configuration for the sync engine.

use crate::clock::TokioClock;
use offsync_protocol::ConflictPolicy;
use offsync_storage::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of automatic syncs while online. Default: 30 s.
    pub sync_interval: Duration,
    /// Upper bound on one batch request. Default: 30 s.
    pub request_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// How conflicts are settled. Default: server wins.
    pub conflict_policy: ConflictPolicy,
    /// Usage/quota ratio at which storage warnings fire. Default: 0.9.
    pub quota_warning_ratio: f64,
    /// How many terminal errors `sync_errors` keeps. Default: 100.
    pub max_sync_errors: usize,
    /// Source of `enqueuedAt` and backoff timestamps.
    pub clock: Arc<dyn Clock>,
}

impl SyncConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            conflict_policy: ConflictPolicy::ServerWins,
            quota_warning_ratio: 0.9,
            max_sync_errors: 100,
            clock: Arc::new(TokioClock::new()),
        }
    }

    /// Sets the sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the storage warning ratio.
    pub fn with_quota_warning_ratio(mut self, ratio: f64) -> Self {
        self.quota_warning_ratio = ratio;
        self
    }

    /// Sets how many terminal errors are kept.
    pub fn with_max_sync_errors(mut self, max: usize) -> Self {
        self.max_sync_errors = max;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Failed attempts allowed before a change is exhausted. Default: 3.
    pub max_retries: u32,
    /// Base delay. Default: 1 s.
    pub retry_delay: Duration,
    /// Cap on any single delay. Default: 5 min.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a configuration allowing `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the next attempt of a change that has failed
    /// `retry_count` times: `retry_delay * 2^retry_count`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns true once `retry_count` is past the limit.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
