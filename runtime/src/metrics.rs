//! Prometheus metrics for the dispatcher and the cache.
//!
//! Metric names:
//! - `dispatcher_requests_*_total` - request lifecycle counters
//! - `dispatcher_queue_pending` - depth of the most recently touched queue
//! - `dispatcher_request_duration_seconds` - adapter call latency
//! - `cache_*_total` - cache writes, revalidations and evictions
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(body) = server.render() {
//!     println!("{body}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder.
///
/// Installs the global recorder and renders the exposition text for whatever
/// HTTP layer the application scrapes through.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the metrics are meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (another server, or a test) is
    /// tolerated: this server then has no handle and `render` returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "dispatcher_requests_submitted_total",
        "Requests accepted into a queue"
    );
    describe_counter!(
        "dispatcher_requests_started_total",
        "Adapter attempts started, retries included"
    );
    describe_counter!(
        "dispatcher_requests_succeeded_total",
        "Requests that settled successfully"
    );
    describe_counter!(
        "dispatcher_requests_failed_total",
        "Requests that settled with an error after exhausting retries"
    );
    describe_counter!(
        "dispatcher_requests_retried_total",
        "Failed attempts that were re-enqueued for retry"
    );
    describe_counter!(
        "dispatcher_requests_canceled_total",
        "Requests that settled as canceled"
    );
    describe_counter!(
        "dispatcher_requests_deduplicated_total",
        "Submissions that joined an identical pending or running request"
    );
    describe_counter!(
        "dispatcher_requests_debounced_total",
        "Submissions that replaced a request inside its debounce window"
    );
    describe_gauge!(
        "dispatcher_queue_pending",
        "Pending requests on the most recently updated queue"
    );
    describe_histogram!(
        "dispatcher_request_duration_seconds",
        "Time spent in a single adapter attempt"
    );

    describe_counter!("cache_writes_total", "Responses stored in the cache");
    describe_counter!(
        "cache_revalidations_total",
        "Entries invalidated through revalidate"
    );
    describe_counter!(
        "cache_evictions_total",
        "Entries removed by garbage collection"
    );
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record an accepted submission and the resulting queue depth.
    pub fn record_submitted(pending: usize) {
        counter!("dispatcher_requests_submitted_total").increment(1);
        Self::record_pending(pending);
    }

    /// Record the depth of a queue.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(pending: usize) {
        gauge!("dispatcher_queue_pending").set(pending as f64);
    }

    /// Record an adapter attempt being started.
    pub fn record_started() {
        counter!("dispatcher_requests_started_total").increment(1);
    }

    /// Record the latency of one adapter attempt.
    pub fn record_duration(duration: Duration) {
        histogram!("dispatcher_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a successful settlement.
    pub fn record_success() {
        counter!("dispatcher_requests_succeeded_total").increment(1);
    }

    /// Record a terminal failure.
    pub fn record_failure() {
        counter!("dispatcher_requests_failed_total").increment(1);
    }

    /// Record a retry being scheduled.
    pub fn record_retry() {
        counter!("dispatcher_requests_retried_total").increment(1);
    }

    /// Record a cancellation.
    pub fn record_canceled() {
        counter!("dispatcher_requests_canceled_total").increment(1);
    }

    /// Record a submission joining an existing request.
    pub fn record_deduplicated() {
        counter!("dispatcher_requests_deduplicated_total").increment(1);
    }

    /// Record a submission collapsing into a debounced request.
    pub fn record_debounced() {
        counter!("dispatcher_requests_debounced_total").increment(1);
    }
}
