//! Client - the process-scoped composition root.
//!
//! A [`Client`] owns one [`Cache`], one [`EffectRegistry`] and one
//! [`Dispatcher`] wired to a transport [`Adapter`]. Create it once per
//! application and tear it down with [`Client::clear`].
//!
//! # Example
//!
//! ```rust
//! use courier_core::{AdapterResponse, Method, Response, from_fn};
//! use courier_runtime::Client;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(from_fn(|request, _signal| async move {
//!     AdapterResponse::from(Response::success(json!({ "url": request.url() }), 200))
//! }));
//!
//! let request = client.request(Method::Get, "/users/:id").set_param("id", 1);
//! let outcome = client.fetch(request.clone()).await?;
//!
//! assert!(outcome.response.is_success());
//! assert!(client.cache().get(&request.cache_key()).is_some());
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientConfig, InitialDataPolicy};
use crate::dispatcher::{Dispatcher, RequestHandle};
use crate::error::DispatchError;
use courier_core::{
    Adapter, Cache, Clock, EffectRegistry, Method, RequestDescriptor, RequestOutcome, Response,
    SystemClock, Timeout,
};
use std::sync::Arc;

/// Composition root holding the cache, the effect registry and the dispatcher.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Client {
    cache: Cache,
    effects: EffectRegistry,
    dispatcher: Dispatcher,
    config: ClientConfig,
}

impl Client {
    /// Create a client with the default configuration.
    #[must_use]
    pub fn new(adapter: impl Adapter) -> Self {
        Self::with_config(adapter, ClientConfig::default())
    }

    /// Create a client with a custom configuration.
    #[must_use]
    pub fn with_config(adapter: impl Adapter, config: ClientConfig) -> Self {
        Self::with_clock(adapter, config, Arc::new(SystemClock))
    }

    /// Create a client whose response timestamps come from `clock`.
    ///
    /// The adapter is wrapped in [`Timeout`], so descriptor timeouts apply to
    /// every attempt.
    #[must_use]
    pub fn with_clock(adapter: impl Adapter, config: ClientConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::with_clock(clock);
        let effects = EffectRegistry::new();
        let dispatcher = Dispatcher::new(
            Arc::new(Timeout::new(adapter)),
            cache.clone(),
            effects.clone(),
            config.retry_policy.clone(),
        );

        tracing::debug!(
            retry = config.retry,
            cache_time_ms = config.cache_time.as_millis(),
            policy = ?config.initial_data_policy,
            "Created client"
        );

        Self {
            cache,
            effects,
            dispatcher,
            config,
        }
    }

    /// Start a descriptor carrying the configured request defaults.
    #[must_use]
    pub fn request(&self, method: Method, endpoint: impl Into<String>) -> RequestDescriptor {
        RequestDescriptor::new(method, endpoint)
            .set_cache_time(self.config.cache_time)
            .set_garbage_collection(self.config.garbage_collection)
            .set_retry(self.config.retry)
            .set_retry_time(self.config.retry_time)
            .set_backoff(self.config.backoff)
    }

    /// Submit a request to the dispatcher.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::add`].
    pub fn submit(&self, request: RequestDescriptor) -> Result<RequestHandle, DispatchError> {
        self.dispatcher.add(request)
    }

    /// Submit a request and wait for its terminal outcome.
    ///
    /// Transport and validation failures are part of the returned outcome.
    ///
    /// # Errors
    ///
    /// - Any error of [`Dispatcher::add`]
    /// - [`DispatchError::Dropped`] if the request was deleted before settling
    pub async fn fetch(&self, request: RequestDescriptor) -> Result<RequestOutcome, DispatchError> {
        let handle = self.submit(request)?;
        handle.wait().await.ok_or(DispatchError::Dropped(handle.id()))
    }

    /// The value a consumer should show before `request` settles.
    ///
    /// Chooses between the cached entry for the request's cache key and
    /// caller-supplied `initial` data according to the configured
    /// [`InitialDataPolicy`]. Returns `None` if neither applies.
    #[must_use]
    pub fn initial_response(&self, request: &RequestDescriptor, initial: Option<Response>) -> Option<Response> {
        let cached = self.cache.get(&request.cache_key());

        match self.config.initial_data_policy {
            InitialDataPolicy::PreferFreshCache => {
                let now = self.cache.now();
                cached
                    .filter(|entry| !entry.is_stale(now))
                    .map(|entry| entry.response)
                    .or(initial)
            },
            InitialDataPolicy::PreferCache => cached.map(|entry| entry.response).or(initial),
            InitialDataPolicy::PreferInitial => initial.or_else(|| cached.map(|entry| entry.response)),
        }
    }

    /// Whether a request for `queue_key` is executing right now.
    #[must_use]
    pub fn is_loading(&self, queue_key: &str) -> bool {
        self.dispatcher.has_running_requests(queue_key)
    }

    /// Tear down all state.
    ///
    /// Aborts running requests, drops every queue record, unregisters every
    /// effect, removes every cache entry and drops every cache subscription.
    pub fn clear(&self) {
        self.dispatcher.clear();
        self.effects.clear();
        self.cache.clear();
        self.cache.clear_listeners();
        tracing::info!("Cleared client state");
    }

    /// The cache store.
    #[must_use]
    pub const fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The effect registry.
    #[must_use]
    pub const fn effects(&self) -> &EffectRegistry {
        &self.effects
    }

    /// The configuration this client was created with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cache_entries", &self.cache.len())
            .field("effects", &self.effects.len())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
