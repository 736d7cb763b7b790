//! # Courier Testing
//!
//! Testing utilities and helpers for the Courier request orchestration engine.
//!
//! This crate provides:
//! - Deterministic clocks for response timestamps and staleness checks
//! - A scripted [`MockAdapter`] standing in for the transport layer
//! - An [`EffectRecorder`] capturing request lifecycle notifications
//! - proptest strategies for descriptor inputs
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::Client;
//! use courier_testing::{MockAdapter, MockResponse};
//!
//! #[tokio::test(start_paused = true)]
//! async fn loads_users() {
//!     let adapter = MockAdapter::new();
//!     adapter.on("/users", [MockResponse::success(json!([]), 200)]);
//!
//!     let client = Client::new(adapter.clone());
//!     let outcome = client.fetch(client.request(Method::Get, "/users")).await.unwrap();
//!
//!     assert!(outcome.response.is_success());
//!     assert_eq!(adapter.call_count(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

/// Scripted transport adapter
pub mod adapter;

/// Lifecycle notification recorder
pub mod effects;

/// Mock implementations of the injected dependencies.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the cache.
    ///
    /// ```
    /// use courier_testing::mocks::ManualClock;
    /// use courier_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::starting_at_epoch();
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(30));
    /// assert_eq!((clock.now() - before).num_seconds(), 30);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Create a clock reading the same instant as [`test_clock`]
        #[must_use]
        pub fn starting_at_epoch() -> Self {
            Self::new(test_clock().now())
        }

        /// Move the clock forward by `by`
        ///
        /// Durations too large for chrono are ignored.
        pub fn advance(&self, by: Duration) {
            if let Ok(delta) = chrono::Duration::from_std(by) {
                let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
                *time += delta;
            }
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use courier_core::Method;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Any request method.
    pub fn method() -> impl Strategy<Value = Method> {
        prop_oneof![
            Just(Method::Get),
            Just(Method::Post),
            Just(Method::Put),
            Just(Method::Patch),
            Just(Method::Delete),
            Just(Method::Head),
            Just(Method::Options),
        ]
    }

    /// A path-segment-safe identifier.
    pub fn segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,8}"
    }

    /// A scalar query value (string, integer or boolean).
    pub fn query_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-zA-Z0-9]{0,6}".prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    /// Up to `max` distinct query params.
    pub fn query(max: usize) -> impl Strategy<Value = Vec<(String, Value)>> {
        proptest::collection::btree_map(segment(), query_value(), 0..=max)
            .prop_map(|map| map.into_iter().collect())
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
///
/// Handy when debugging a failing test; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use adapter::{MockAdapter, MockCall, MockResponse};
pub use effects::{EffectRecorder, LifecycleEvent, RecordedEvent};
pub use mocks::{FixedClock, ManualClock, test_clock};
