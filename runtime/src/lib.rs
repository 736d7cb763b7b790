//! # Courier Runtime
//!
//! Runtime for the Courier request orchestration engine.
//!
//! This crate turns request descriptors into executions: it queues them per
//! key, invokes the transport adapter, retries failures, writes results to the
//! cache and notifies request effects.
//!
//! ## Core Components
//!
//! - **Client**: Composition root owning the cache, the effect registry and the dispatcher
//! - **Dispatcher**: Per-key ordered execution with concurrency control and cancellation
//! - **Retry Policy**: Fixed or exponential delays between attempts
//! - **Metrics**: Prometheus recorder and metric descriptions
//!
//! ## Example
//!
//! ```rust
//! use courier_core::{AdapterResponse, Method, RequestEffect, Response, from_fn};
//! use courier_runtime::Client;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(from_fn(|_request, _signal| async {
//!     AdapterResponse::from(Response::success(json!([1, 2, 3]), 200))
//! }));
//!
//! let request = client.request(Method::Get, "/items");
//! client.effects().register(
//!     RequestEffect::new(request.effect_key())
//!         .on_success(|outcome, _| println!("loaded {:?}", outcome.response.data)),
//! );
//!
//! let handle = client.submit(request)?;
//! let outcome = handle.wait().await;
//! assert!(outcome.is_some_and(|o| o.response.is_success()));
//! # Ok(())
//! # }
//! ```

/// Composition root
pub mod client;

/// Client configuration
pub mod config;

/// Per-key request execution
pub mod dispatcher;

/// Prometheus metrics for observability
pub mod metrics;

/// Per-key queue records
mod queue;

/// Retry delay calculation
pub mod retry;

/// Error types for the dispatcher
pub mod error {
    use crate::queue::RequestId;
    use thiserror::Error;

    /// Errors returned when submitting to the dispatcher.
    ///
    /// Failures of the request itself (transport, validation, remote errors)
    /// are never reported here; they travel through the request's outcome,
    /// the cache and the effects.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// The queue key is stopped and rejects new submissions
        #[error("Queue {0} is stopped")]
        QueueStopped(String),

        /// Submission happened outside a tokio runtime
        #[error("No async runtime available to execute requests")]
        RuntimeUnavailable,

        /// The request was deleted or the dispatcher cleared before it settled
        #[error("Request {0} was removed before it settled")]
        Dropped(RequestId),
    }
}

pub use client::Client;
pub use config::{ClientConfig, InitialDataPolicy};
pub use dispatcher::{Dispatcher, RequestHandle};
pub use error::DispatchError;
pub use queue::{QueueSnapshot, RequestId};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
