//! Transport adapter contract.
//!
//! The core never performs network I/O itself. An [`Adapter`] receives a
//! [`ResolvedRequest`] and an [`AbortSignal`] and resolves, asynchronously, to
//! an [`AdapterResponse`]. Timeouts are an adapter concern: wrap any adapter in
//! [`Timeout`] to honor [`RequestDescriptor::timeout`].

use crate::descriptor::RequestDescriptor;
use crate::response::{RequestError, Response};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// A request whose endpoint params have been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    /// The descriptor being executed
    pub descriptor: RequestDescriptor,
    /// Endpoint with params substituted
    pub endpoint: String,
    /// Canonical query string (empty or starting with `?`)
    pub query: String,
}

impl ResolvedRequest {
    /// Resolve `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] if an endpoint param is missing.
    pub fn new(descriptor: RequestDescriptor) -> Result<Self, RequestError> {
        let endpoint = descriptor.resolve_endpoint()?;
        let query = descriptor.query_string();
        Ok(Self {
            descriptor,
            endpoint,
            query,
        })
    }

    /// Endpoint followed by the query string.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}{}", self.endpoint, self.query)
    }
}

/// What an adapter hands back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResponse {
    /// The `(data, error, status)` tuple
    pub response: Response,
    /// Whether the adapter detected it was offline
    pub is_offline: bool,
}

impl From<Response> for AdapterResponse {
    fn from(response: Response) -> Self {
        Self {
            response,
            is_offline: false,
        }
    }
}

/// Out-of-band cancellation signal passed to adapters.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Whether abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is requested. Never resolves if the controller is
    /// dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owning side of an [`AbortSignal`].
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    /// Create a controller that has not been aborted.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal observing this controller.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Request abort. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport adapter.
///
/// Implementations should stop work and resolve promptly once `signal`
/// aborts; the dispatcher ignores whatever they return after that point.
pub trait Adapter: Send + Sync + 'static {
    /// Perform one attempt of `request`.
    fn execute(&self, request: ResolvedRequest, signal: AbortSignal) -> BoxFuture<'static, AdapterResponse>;
}

impl<A: Adapter + ?Sized> Adapter for Arc<A> {
    fn execute(&self, request: ResolvedRequest, signal: AbortSignal) -> BoxFuture<'static, AdapterResponse> {
        (**self).execute(request, signal)
    }
}

/// Adapter built from a closure. See [`from_fn`].
pub struct FnAdapter<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnAdapter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAdapter").finish_non_exhaustive()
    }
}

/// Wrap an async closure as an [`Adapter`].
///
/// ```
/// use courier_core::adapter::{from_fn, AdapterResponse};
/// use courier_core::response::Response;
/// use serde_json::json;
///
/// let adapter = from_fn(|request, _signal| async move {
///     AdapterResponse::from(Response::success(json!({ "url": request.url() }), 200))
/// });
/// # let _ = adapter;
/// ```
pub const fn from_fn<F, Fut>(f: F) -> FnAdapter<F>
where
    F: Fn(ResolvedRequest, AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdapterResponse> + Send + 'static,
{
    FnAdapter { f }
}

impl<F, Fut> Adapter for FnAdapter<F>
where
    F: Fn(ResolvedRequest, AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdapterResponse> + Send + 'static,
{
    fn execute(&self, request: ResolvedRequest, signal: AbortSignal) -> BoxFuture<'static, AdapterResponse> {
        Box::pin((self.f)(request, signal))
    }
}

/// Adapter wrapper enforcing the descriptor's timeout.
///
/// An attempt that outlives the timeout resolves to a
/// [`TransportErrorKind::Timeout`](crate::response::TransportErrorKind::Timeout) failure.
#[derive(Debug, Clone)]
pub struct Timeout<A> {
    inner: A,
}

impl<A> Timeout<A> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

impl<A: Adapter> Adapter for Timeout<A> {
    fn execute(&self, request: ResolvedRequest, signal: AbortSignal) -> BoxFuture<'static, AdapterResponse> {
        let limit = request.descriptor.timeout();
        let attempt = self.inner.execute(request, signal);

        match limit {
            None => attempt,
            Some(limit) => Box::pin(async move {
                if let Ok(response) = tokio::time::timeout(limit, attempt).await {
                    response
                } else {
                    tracing::debug!(timeout_ms = limit.as_millis(), "Adapter attempt timed out");
                    Response::failure(
                        RequestError::timeout(format!("no response within {}ms", limit.as_millis())),
                        None,
                    )
                    .into()
                }
            }),
        }
    }
}
