//! Scripted transport adapter.
//!
//! A [`MockAdapter`] answers each attempt from a script registered under the
//! request's cache key, its full URL or its resolved endpoint (checked in that
//! order). Each script is a sequence of [`MockResponse`]s consumed one per
//! attempt; the last one repeats. Latency is simulated with `tokio::time`, so
//! tests on a paused runtime control it exactly. Every attempt is logged.

use courier_core::{
    AbortSignal, Adapter, AdapterResponse, Method, RequestError, ResolvedRequest, Response,
};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    response: AdapterResponse,
    latency: Duration,
}

impl MockResponse {
    /// Successful response carrying `data`
    #[must_use]
    pub fn success(data: Value, status: u16) -> Self {
        Response::success(data, status).into()
    }

    /// Failed response carrying `error`
    #[must_use]
    pub fn failure(error: RequestError, status: Option<u16>) -> Self {
        Response::failure(error, status).into()
    }

    /// Network transport failure
    #[must_use]
    pub fn network_error(message: &str) -> Self {
        Self::failure(RequestError::network(message), None)
    }

    /// Error payload returned by the remote side
    #[must_use]
    pub fn remote_error(payload: Value, status: u16) -> Self {
        Self::failure(RequestError::Remote(payload), Some(status))
    }

    /// Resolve only after `latency`
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report the attempt as made while offline
    #[must_use]
    pub const fn offline(mut self) -> Self {
        self.response.is_offline = true;
        self
    }
}

impl From<Response> for MockResponse {
    fn from(response: Response) -> Self {
        Self {
            response: response.into(),
            latency: Duration::ZERO,
        }
    }
}

/// One logged attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    /// Request method
    pub method: Method,
    /// Endpoint plus query string
    pub url: String,
    /// Cache key of the descriptor
    pub cache_key: String,
    /// Request payload
    pub payload: Option<Value>,
    /// When the attempt started, on tokio's clock
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<MockResponse>,
}

impl Script {
    fn next(&mut self) -> Option<MockResponse> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    scripts: Mutex<HashMap<String, Script>>,
    fallback: Mutex<Option<MockResponse>>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    aborted: AtomicUsize,
}

/// Scripted [`Adapter`] for tests.
///
/// Clones share scripts and the call log.
///
/// ```
/// use courier_testing::{MockAdapter, MockResponse};
/// use serde_json::json;
///
/// let adapter = MockAdapter::new();
/// adapter.on("/users", [
///     MockResponse::network_error("connection reset"),
///     MockResponse::success(json!([]), 200),
/// ]);
/// assert_eq!(adapter.call_count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<MockState>,
}

impl MockAdapter {
    /// Adapter with no scripts; unscripted requests fail with a network error.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `responses` to the script for `key` (cache key, URL or endpoint).
    pub fn on(&self, key: impl Into<String>, responses: impl IntoIterator<Item = MockResponse>) -> &Self {
        self.state
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.into())
            .or_default()
            .responses
            .extend(responses);
        self
    }

    /// Answer for requests no script matches.
    pub fn fallback(&self, response: MockResponse) -> &Self {
        *self.state.fallback.lock().unwrap_or_else(PoisonError::into_inner) = Some(response);
        self
    }

    /// Every attempt so far, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attempts whose URL or cache key equals `key`.
    #[must_use]
    pub fn calls_for(&self, key: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.url == key || call.cache_key == key)
            .collect()
    }

    /// Number of attempts so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Payloads of all attempts, in start order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Option<Value>> {
        self.calls().into_iter().map(|call| call.payload).collect()
    }

    /// Attempts currently awaiting their response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous attempts observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Attempts that observed their abort signal.
    #[must_use]
    pub fn aborted_count(&self) -> usize {
        self.state.aborted.load(Ordering::SeqCst)
    }

    fn next_response(&self, request: &ResolvedRequest) -> MockResponse {
        let mut scripts = self.state.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let keys = [request.descriptor.cache_key(), request.url(), request.endpoint.clone()];

        keys.iter()
            .find_map(|key| scripts.get_mut(key).and_then(Script::next))
            .or_else(|| {
                self.state
                    .fallback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_else(|| MockResponse::network_error(&format!("no mock response for {}", request.url())))
    }
}

/// Decrements the in-flight counter however the attempt ends.
struct InFlight(Arc<MockState>);

impl InFlight {
    fn enter(state: &Arc<MockState>) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Adapter for MockAdapter {
    fn execute(&self, request: ResolvedRequest, signal: AbortSignal) -> BoxFuture<'static, AdapterResponse> {
        let scripted = self.next_response(&request);
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall {
                method: request.descriptor.method(),
                url: request.url(),
                cache_key: request.descriptor.cache_key(),
                payload: request.descriptor.payload().cloned(),
                started_at: Instant::now(),
            });

        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let _guard = InFlight::enter(&state);
            tokio::select! {
                biased;
                () = signal.aborted() => {
                    state.aborted.fetch_add(1, Ordering::SeqCst);
                    Response::failure(RequestError::abort("aborted by caller"), None).into()
                },
                () = tokio::time::sleep(scripted.latency) => scripted.response,
            }
        })
    }
}
