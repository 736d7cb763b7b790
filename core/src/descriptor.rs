//! Request descriptors.
//!
//! A [`RequestDescriptor`] is an immutable value describing one remote
//! operation together with its cache and queue policy. Every `set_*` method
//! returns a modified copy; the receiver is never altered, so one descriptor can
//! be shared freely between concurrent submissions.
//!
//! # Key canonicalization
//!
//! The derived cache key is `"{METHOD}_{endpoint}{query}"`:
//!
//! - `endpoint` is the template with each `:name` segment replaced by the
//!   percent-encoded param value. Placeholders without a param are kept
//!   verbatim.
//! - `query` is empty when no query values are set. Otherwise it is `?`
//!   followed by form-urlencoded `key=value` pairs joined with `&`, ordered by
//!   key. Strings are taken raw, numbers and booleans in JSON form, `null` as an
//!   empty value. Arrays expand to one pair per element in array order. Objects
//!   are written as compact JSON with keys sorted at every level.
//!
//! Encoding happens before keys are joined, so a value containing `&`, `=`,
//! `/` or `?` can never be confused with a separator.
//!
//! The queue key defaults to the cache key and the effect key defaults to the
//! queue key.
//!
//! ```
//! use courier_core::descriptor::{Method, RequestDescriptor};
//!
//! let request = RequestDescriptor::new(Method::Get, "/users/:userId")
//!     .set_param("userId", 7)
//!     .set_query_param("page", 2)
//!     .set_query_param("sort", "name");
//!
//! assert_eq!(request.cache_key(), "GET_/users/7?page=2&sort=name");
//! assert_eq!(request.queue_key(), request.cache_key());
//! ```

use crate::response::RequestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default time after which cached data is considered stale.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default idle time after which an unreferenced cache entry is evicted.
pub const DEFAULT_GARBAGE_COLLECTION: Duration = Duration::from_secs(5 * 60);

/// Default base delay between retries.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_millis(500);

/// Default debounce window.
pub const DEFAULT_DEBOUNCE_TIME: Duration = Duration::from_millis(400);

/// HTTP-style request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backoff {
    /// Every retry waits `retry_time`
    #[default]
    Fixed,
    /// The delay is multiplied on each retry (see the runtime's retry policy)
    Exponential,
}

/// Immutable description of one remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    method: Method,
    endpoint: String,
    params: BTreeMap<String, String>,
    query: BTreeMap<String, Value>,
    payload: Option<Value>,
    headers: BTreeMap<String, String>,
    cache_key: Option<String>,
    queue_key: Option<String>,
    effect_key: Option<String>,
    cache: bool,
    cache_time: Duration,
    garbage_collection: Option<Duration>,
    cache_canceled: bool,
    retry: u32,
    retry_time: Duration,
    backoff: Backoff,
    concurrent: bool,
    deduplicate: bool,
    debounce: bool,
    debounce_time: Duration,
    timeout: Option<Duration>,
}

impl RequestDescriptor {
    /// Create a descriptor with default policies.
    #[must_use]
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            query: BTreeMap::new(),
            payload: None,
            headers: BTreeMap::new(),
            cache_key: None,
            queue_key: None,
            effect_key: None,
            cache: true,
            cache_time: DEFAULT_CACHE_TIME,
            garbage_collection: Some(DEFAULT_GARBAGE_COLLECTION),
            cache_canceled: false,
            retry: 0,
            retry_time: DEFAULT_RETRY_TIME,
            backoff: Backoff::Fixed,
            concurrent: false,
            deduplicate: false,
            debounce: false,
            debounce_time: DEFAULT_DEBOUNCE_TIME,
            timeout: None,
        }
    }

    fn with(&self, update: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        update(&mut next);
        next
    }

    /// Substitute the `:name` endpoint segment.
    #[must_use]
    pub fn set_param(&self, name: impl Into<String>, value: impl ToString) -> Self {
        self.with(|d| {
            d.params.insert(name.into(), value.to_string());
        })
    }

    /// Substitute several endpoint segments at once.
    #[must_use]
    pub fn set_params<K, V>(&self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        self.with(|d| {
            for (name, value) in params {
                d.params.insert(name.into(), value.to_string());
            }
        })
    }

    /// Add a query value.
    #[must_use]
    pub fn set_query_param(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(|d| {
            d.query.insert(name.into(), value.into());
        })
    }

    /// Replace all query values.
    #[must_use]
    pub fn set_query(&self, query: BTreeMap<String, Value>) -> Self {
        self.with(|d| d.query = query)
    }

    /// Set the request body.
    #[must_use]
    pub fn set_payload(&self, payload: impl Into<Value>) -> Self {
        self.with(|d| d.payload = Some(payload.into()))
    }

    /// Add a header passed through to the adapter.
    #[must_use]
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(|d| {
            d.headers.insert(name.into(), value.into());
        })
    }

    /// Override the derived cache key.
    #[must_use]
    pub fn set_cache_key(&self, key: impl Into<String>) -> Self {
        self.with(|d| d.cache_key = Some(key.into()))
    }

    /// Override the queue key.
    #[must_use]
    pub fn set_queue_key(&self, key: impl Into<String>) -> Self {
        self.with(|d| d.queue_key = Some(key.into()))
    }

    /// Override the effect key.
    #[must_use]
    pub fn set_effect_key(&self, key: impl Into<String>) -> Self {
        self.with(|d| d.effect_key = Some(key.into()))
    }

    /// Enable or disable cache writes.
    #[must_use]
    pub fn set_cache(&self, enabled: bool) -> Self {
        self.with(|d| d.cache = enabled)
    }

    /// Time after which cached data is stale. Zero means never stale.
    #[must_use]
    pub fn set_cache_time(&self, cache_time: Duration) -> Self {
        self.with(|d| d.cache_time = cache_time)
    }

    /// Idle time before an unreferenced entry is evicted. `None` keeps it forever.
    #[must_use]
    pub fn set_garbage_collection(&self, after: Option<Duration>) -> Self {
        self.with(|d| d.garbage_collection = after)
    }

    /// Store canceled results in the cache.
    #[must_use]
    pub fn set_cache_canceled(&self, enabled: bool) -> Self {
        self.with(|d| d.cache_canceled = enabled)
    }

    /// Number of automatic retries after a failure.
    #[must_use]
    pub fn set_retry(&self, retry: u32) -> Self {
        self.with(|d| d.retry = retry)
    }

    /// Base delay between retries.
    #[must_use]
    pub fn set_retry_time(&self, retry_time: Duration) -> Self {
        self.with(|d| d.retry_time = retry_time)
    }

    /// Retry delay growth.
    #[must_use]
    pub fn set_backoff(&self, backoff: Backoff) -> Self {
        self.with(|d| d.backoff = backoff)
    }

    /// Allow this request to run while others on its queue key are running.
    #[must_use]
    pub fn set_concurrent(&self, concurrent: bool) -> Self {
        self.with(|d| d.concurrent = concurrent)
    }

    /// Join an identical pending or running request instead of enqueuing.
    #[must_use]
    pub fn set_deduplicate(&self, deduplicate: bool) -> Self {
        self.with(|d| d.deduplicate = deduplicate)
    }

    /// Collapse rapid submissions on the same queue key.
    #[must_use]
    pub fn set_debounce(&self, debounce: bool) -> Self {
        self.with(|d| d.debounce = debounce)
    }

    /// Debounce window.
    #[must_use]
    pub fn set_debounce_time(&self, debounce_time: Duration) -> Self {
        self.with(|d| d.debounce_time = debounce_time)
    }

    /// Adapter-level timeout.
    #[must_use]
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Self {
        self.with(|d| d.timeout = timeout)
    }

    /// Request method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Endpoint template as supplied.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Endpoint params.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Query values.
    #[must_use]
    pub const fn query(&self) -> &BTreeMap<String, Value> {
        &self.query
    }

    /// Request body.
    #[must_use]
    pub const fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Headers.
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Whether results are written to the cache.
    #[must_use]
    pub const fn cache(&self) -> bool {
        self.cache
    }

    /// Staleness window.
    #[must_use]
    pub const fn cache_time(&self) -> Duration {
        self.cache_time
    }

    /// Garbage-collection idle time.
    #[must_use]
    pub const fn garbage_collection(&self) -> Option<Duration> {
        self.garbage_collection
    }

    /// Whether canceled results are cached.
    #[must_use]
    pub const fn cache_canceled(&self) -> bool {
        self.cache_canceled
    }

    /// Retry count.
    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    /// Base retry delay.
    #[must_use]
    pub const fn retry_time(&self) -> Duration {
        self.retry_time
    }

    /// Retry delay growth.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Whether concurrent execution on the queue key is allowed.
    #[must_use]
    pub const fn concurrent(&self) -> bool {
        self.concurrent
    }

    /// Whether identical requests are joined.
    #[must_use]
    pub const fn deduplicate(&self) -> bool {
        self.deduplicate
    }

    /// Whether submissions are debounced.
    #[must_use]
    pub const fn debounce(&self) -> bool {
        self.debounce
    }

    /// Debounce window.
    #[must_use]
    pub const fn debounce_time(&self) -> Duration {
        self.debounce_time
    }

    /// Adapter-level timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Endpoint with params substituted, failing on unresolved placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] naming the first param without a value.
    pub fn resolve_endpoint(&self) -> Result<String, RequestError> {
        let (endpoint, missing) = substitute(&self.endpoint, &self.params);
        match missing.first() {
            Some(name) => Err(RequestError::Validation(format!(
                "missing value for endpoint param `{name}` in `{}`",
                self.endpoint
            ))),
            None => Ok(endpoint),
        }
    }

    /// Canonical query string, including the leading `?` when non-empty.
    #[must_use]
    pub fn query_string(&self) -> String {
        encode_query(&self.query)
    }

    /// Identity of this request's cached result.
    #[must_use]
    pub fn cache_key(&self) -> String {
        if let Some(key) = &self.cache_key {
            return key.clone();
        }
        let (endpoint, _) = substitute(&self.endpoint, &self.params);
        format!("{}_{endpoint}{}", self.method, self.query_string())
    }

    /// Serialization domain of this request.
    #[must_use]
    pub fn queue_key(&self) -> String {
        self.queue_key.clone().unwrap_or_else(|| self.cache_key())
    }

    /// Key used to look up registered request effects.
    #[must_use]
    pub fn effect_key(&self) -> String {
        self.effect_key.clone().unwrap_or_else(|| self.queue_key())
    }
}

/// Replace `:name` segments. Returns the result and the names left unresolved.
fn substitute(template: &str, params: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find(':') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..len];

        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            out.push(':');
            out.push_str(name);
        } else if let Some(value) = params.get(name) {
            out.push_str(&urlencoding::encode(value));
        } else {
            out.push(':');
            out.push_str(name);
            missing.push(name.to_owned());
        }
        rest = &after[len..];
    }
    out.push_str(rest);

    (out, missing)
}

fn encode_query(query: &BTreeMap<String, Value>) -> String {
    let mut pairs: Vec<(&str, String)> = Vec::with_capacity(query.len());
    for (name, value) in query {
        match value {
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (name.as_str(), query_value(item))));
            },
            other => pairs.push((name.as_str(), query_value(other))),
        }
    }

    if pairs.is_empty() {
        return String::new();
    }
    match serde_urlencoded::to_string(&pairs) {
        Ok(encoded) => format!("?{encoded}"),
        Err(error) => {
            tracing::error!(%error, "Failed to encode query string");
            String::new()
        },
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => canonical_json(value),
    }
}

/// Compact JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        },
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        },
        other => other.to_string(),
    }
}
