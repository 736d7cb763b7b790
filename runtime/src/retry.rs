//! Retry delay calculation for failed requests.
//!
//! A descriptor decides *whether* to retry (`retry` count) and the base delay
//! (`retry_time`) and growth mode ([`Backoff`]). The [`RetryPolicy`] held by the
//! client supplies the remaining knobs for exponential growth.
//!
//! # Example
//!
//! ```rust
//! use courier_core::{Backoff, Method, RequestDescriptor};
//! use courier_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .multiplier(2.0)
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let request = RequestDescriptor::new(Method::Get, "/users")
//!     .set_retry(3)
//!     .set_retry_time(Duration::from_millis(100))
//!     .set_backoff(Backoff::Exponential);
//!
//! assert_eq!(policy.delay_for(&request, 2), Duration::from_millis(400));
//! ```

use courier_core::{Backoff, RequestDescriptor};
use std::time::Duration;

/// Exponential backoff parameters.
///
/// # Default Values
///
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `max_delay`: 30 seconds
/// - `jitter`: disabled
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `0.5..=1.0`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            multiplier: Some(2.0),
            max_delay: Some(Duration::from_secs(30)),
            jitter: Some(false),
        }
    }

    /// Delay before retry number `attempt + 1` of `request` (`attempt` is 0-indexed).
    ///
    /// Fixed backoff always waits `retry_time`. Exponential backoff waits
    /// `retry_time * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, request: &RequestDescriptor, attempt: u32) -> Duration {
        let base = request.retry_time();

        let delay = match request.backoff() {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                // Retry counts stay far below i32::MAX; millisecond precision is enough
                #[allow(
                    clippy::cast_possible_wrap,
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                let delay_ms = base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
                #[allow(clippy::cast_precision_loss)]
                let max_ms = self.max_delay.as_millis() as f64;

                if delay_ms >= max_ms {
                    self.max_delay
                } else {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let millis = delay_ms as u64;
                    Duration::from_millis(millis)
                }
            },
        };

        if self.jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    multiplier: Option<f64>,
    max_delay: Option<Duration>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            multiplier: self.multiplier.unwrap_or(2.0),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            jitter: self.jitter.unwrap_or(false),
        }
    }
}
