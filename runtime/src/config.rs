//! Client configuration.

use crate::retry::RetryPolicy;
use courier_core::Backoff;
use courier_core::descriptor::{DEFAULT_CACHE_TIME, DEFAULT_GARBAGE_COLLECTION, DEFAULT_RETRY_TIME};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which value a consumer shows before its first response arrives.
///
/// Decides between the cached entry of a request's cache key and
/// caller-supplied initial data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialDataPolicy {
    /// A non-stale cached entry wins, otherwise initial data. A stale entry is
    /// never shown, so with no initial data the result is empty
    #[default]
    PreferFreshCache,
    /// Any cached entry wins, stale or not
    PreferCache,
    /// Initial data wins whenever supplied
    PreferInitial,
}

/// Configuration for a [`Client`](crate::Client).
///
/// The request defaults are applied by [`Client::request`](crate::Client::request);
/// descriptors built directly with `RequestDescriptor::new` keep their own
/// defaults.
///
/// # Example
///
/// ```rust
/// use courier_runtime::{ClientConfig, InitialDataPolicy};
/// use courier_core::Backoff;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_retry(3)
///     .with_retry_time(Duration::from_millis(200))
///     .with_backoff(Backoff::Exponential)
///     .with_initial_data_policy(InitialDataPolicy::PreferCache);
///
/// assert_eq!(config.retry, 3);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Staleness window for new descriptors
    pub cache_time: Duration,
    /// Garbage collection delay for new descriptors (`None` = never)
    pub garbage_collection: Option<Duration>,
    /// Retry count for new descriptors
    pub retry: u32,
    /// Base retry delay for new descriptors
    pub retry_time: Duration,
    /// Backoff mode for new descriptors
    pub backoff: Backoff,
    /// Exponential backoff parameters
    pub retry_policy: RetryPolicy,
    /// Cached-vs-initial data precedence
    pub initial_data_policy: InitialDataPolicy,
}

impl ClientConfig {
    /// Set the default staleness window
    #[must_use]
    pub const fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Set the default garbage collection delay
    #[must_use]
    pub const fn with_garbage_collection(mut self, after: Option<Duration>) -> Self {
        self.garbage_collection = after;
        self
    }

    /// Set the default retry count
    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default base retry delay
    #[must_use]
    pub const fn with_retry_time(mut self, retry_time: Duration) -> Self {
        self.retry_time = retry_time;
        self
    }

    /// Set the default backoff mode
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the initial data policy
    #[must_use]
    pub const fn with_initial_data_policy(mut self, policy: InitialDataPolicy) -> Self {
        self.initial_data_policy = policy;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_time: DEFAULT_CACHE_TIME,
            garbage_collection: Some(DEFAULT_GARBAGE_COLLECTION),
            retry: 0,
            retry_time: DEFAULT_RETRY_TIME,
            backoff: Backoff::Fixed,
            retry_policy: RetryPolicy::default(),
            initial_data_policy: InitialDataPolicy::default(),
        }
    }
}
