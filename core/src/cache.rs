//! Cache store - keyed response storage with staleness, garbage collection and
//! per-key event notification.
//!
//! # Staleness vs garbage collection
//!
//! Staleness is a read-time judgment: the store never expires stale entries on
//! its own, readers call [`is_stale`] (or [`CacheEntry::is_stale`]) when they
//! access an entry. Garbage collection is a store-time policy: after the
//! writing descriptor's `garbage_collection` idle time elapses with no listener
//! attached to the key, the entry is evicted. An entry that is still listened to
//! when its timer fires is left alone; its idle time restarts once the last
//! listener of the key unsubscribes.
//!
//! # Events
//!
//! [`Cache::on_data`] and [`Cache::on_revalidate`] register listeners per
//! cache key and return a [`Subscription`] disposer. Listeners of one key run
//! in registration order, synchronously, before the emitting call returns.
//! Listener sets are snapshotted before iteration, so a listener may
//! unsubscribe (itself or others) while being notified.
//!
//! ```
//! use courier_core::cache::Cache;
//! use courier_core::descriptor::{Method, RequestDescriptor};
//! use courier_core::response::{Response, ResponseDetails};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let cache = Cache::new();
//! let request = RequestDescriptor::new(Method::Get, "/users").set_cache_key("u1");
//!
//! cache.set(&request, Response::success(json!({ "data": 123 }), 200), ResponseDetails::new(Utc::now()));
//! assert!(cache.get("u1").is_some());
//!
//! cache.delete("u1");
//! assert!(cache.get("u1").is_none());
//! ```

use crate::descriptor::RequestDescriptor;
use crate::environment::{Clock, SystemClock};
use crate::response::{RequestOutcome, Response, ResponseDetails};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Whether data written at `timestamp` is stale at `now`.
///
/// A zero `cache_time` means the data never goes stale.
#[must_use]
pub fn is_stale(cache_time: Duration, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if cache_time.is_zero() {
        return false;
    }
    chrono::Duration::from_std(cache_time)
        .ok()
        .and_then(|window| timestamp.checked_add_signed(window))
        .is_some_and(|deadline| now > deadline)
}

/// One stored result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The `(data, error, status)` tuple
    pub response: Response,
    /// Retry count, timestamp and flags
    pub details: ResponseDetails,
    /// Staleness window of the writing descriptor
    pub cache_time: Duration,
    /// Garbage-collection idle time of the writing descriptor
    pub garbage_collection: Option<Duration>,
}

impl CacheEntry {
    /// Whether this entry is stale at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        is_stale(self.cache_time, self.details.timestamp, now)
    }

    /// The entry as a request outcome.
    #[must_use]
    pub fn outcome(&self) -> RequestOutcome {
        RequestOutcome {
            response: self.response.clone(),
            details: self.details.clone(),
        }
    }
}

type DataListener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;
type RevalidateListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Data,
    Revalidate,
}

struct StoredEntry {
    entry: CacheEntry,
    generation: u64,
    idle_epoch: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, StoredEntry>,
    order: Vec<String>,
}

impl Entries {
    fn remove(&mut self, key: &str) -> bool {
        if self.map.remove(key).is_some() {
            self.order.retain(|existing| existing != key);
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    data: HashMap<String, Vec<(u64, DataListener)>>,
    revalidate: HashMap<String, Vec<(u64, RevalidateListener)>>,
}

impl Listeners {
    fn count(&self, key: &str) -> usize {
        self.data.get(key).map_or(0, Vec::len) + self.revalidate.get(key).map_or(0, Vec::len)
    }
}

struct CacheInner {
    entries: Mutex<Entries>,
    listeners: Mutex<Listeners>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart the idle timer of `key` once nobody listens to it any more.
    ///
    /// Must not be called while the listeners lock is held.
    fn released(self: &Arc<Self>, key: &str) {
        let scheduled = self.entries().map.get_mut(key).and_then(|stored| {
            let after = stored.entry.garbage_collection?;
            stored.idle_epoch += 1;
            Some((stored.generation, stored.idle_epoch, after))
        });

        if let Some((generation, epoch, after)) = scheduled {
            self.schedule_garbage_collection(key.to_owned(), generation, epoch, after);
        }
    }

    /// Evict `key` after `after` unless it was rewritten, deleted, released
    /// again, or is still listened to by then. Requires an ambient tokio runtime.
    fn schedule_garbage_collection(self: &Arc<Self>, key: String, generation: u64, epoch: u64, after: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::trace!(cache_key = %key, "No async runtime, entry will not be garbage collected");
            return;
        };
        let cache = Arc::downgrade(self);

        runtime.spawn(async move {
            tokio::time::sleep(after).await;

            let Some(inner) = cache.upgrade() else {
                return;
            };
            let mut entries = inner.entries();
            match entries.map.get(&key) {
                Some(stored) if stored.generation == generation && stored.idle_epoch == epoch => {},
                _ => return,
            }
            if inner.listeners().count(&key) > 0 {
                tracing::trace!(cache_key = %key, "Entry still referenced, collecting after its last listener leaves");
                return;
            }

            entries.remove(&key);
            metrics::counter!("cache_evictions_total").increment(1);
            tracing::debug!(cache_key = %key, "Garbage collected cache entry");
        });
    }
}

fn remove_listener<T>(map: &mut HashMap<String, Vec<(u64, T)>>, key: &str, id: u64) -> bool {
    let Some(list) = map.get_mut(key) else {
        return false;
    };
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    let removed = list.len() < before;
    if list.is_empty() {
        map.remove(key);
    }
    removed
}

/// Disposer returned by [`Cache::on_data`] and [`Cache::on_revalidate`].
///
/// Dropping it leaves the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    cache: Weak<CacheInner>,
    key: String,
    id: u64,
    kind: ListenerKind,
}

impl Subscription {
    /// Remove the listener. Safe to call from inside a notification.
    pub fn unsubscribe(self) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        let released = {
            let mut listeners = inner.listeners();
            let removed = match self.kind {
                ListenerKind::Data => remove_listener(&mut listeners.data, &self.key, self.id),
                ListenerKind::Revalidate => remove_listener(&mut listeners.revalidate, &self.key, self.id),
            };
            removed && listeners.count(&self.key) == 0
        };

        if released {
            inner.released(&self.key);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// In-memory cache store shared by all readers and writers.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Empty cache using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty cache using `clock` for staleness checks.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(Entries::default()),
                listeners: Mutex::new(Listeners::default()),
                generation: AtomicU64::new(0),
                clock,
            }),
        }
    }

    /// Current time according to the cache's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Read the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries().map.get(key).map(|stored| stored.entry.clone())
    }

    /// Whether the entry for `key` is stale now. Absent entries report `true`.
    #[must_use]
    pub fn is_stale(&self, key: &str) -> bool {
        self.get(key).is_none_or(|entry| entry.is_stale(self.now()))
    }

    /// Write a result for `request`.
    ///
    /// The entry fully replaces any previous one for the key. When the
    /// descriptor has caching disabled nothing is stored, but data listeners
    /// are still notified with the would-be entry.
    pub fn set(&self, request: &RequestDescriptor, response: Response, details: ResponseDetails) {
        let key = request.cache_key();
        let entry = CacheEntry {
            response,
            details,
            cache_time: request.cache_time(),
            garbage_collection: request.garbage_collection(),
        };

        if request.cache() {
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut entries = self.inner.entries();
                if !entries.map.contains_key(&key) {
                    entries.order.push(key.clone());
                }
                entries.map.insert(
                    key.clone(),
                    StoredEntry {
                        entry: entry.clone(),
                        generation,
                        idle_epoch: 0,
                    },
                );
            }
            metrics::counter!("cache_writes_total").increment(1);
            tracing::trace!(cache_key = %key, "Stored cache entry");

            if let Some(after) = entry.garbage_collection {
                self.inner.schedule_garbage_collection(key.clone(), generation, 0, after);
            }
        } else {
            tracing::trace!(cache_key = %key, "Caching disabled for request, notifying only");
        }

        self.emit_data(&key, &entry);
    }

    /// Remove the entry for `key` without notifying anyone.
    ///
    /// Returns whether an entry was present; deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.entries().remove(key)
    }

    /// Delete the entry for `key` and notify its revalidate listeners.
    pub fn revalidate(&self, key: &str) {
        self.delete(key);
        metrics::counter!("cache_revalidations_total").increment(1);
        tracing::debug!(cache_key = %key, "Revalidated cache key");
        self.emit_revalidate(key);
    }

    /// Revalidate every stored or listened-to key matching `predicate`.
    pub fn revalidate_where(&self, predicate: impl Fn(&str) -> bool) {
        let mut keys: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| predicate(key))
            .collect();
        {
            let listeners = self.inner.listeners();
            for key in listeners.revalidate.keys() {
                if predicate(key) && !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        for key in keys {
            self.revalidate(&key);
        }
    }

    /// Stored keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries().order.clone()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries().map.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry without emitting events.
    pub fn clear(&self) {
        let mut entries = self.inner.entries();
        entries.map.clear();
        entries.order.clear();
        tracing::debug!("Cleared cache");
    }

    /// Drop every data and revalidate listener.
    ///
    /// Stored entries become collectable again.
    pub fn clear_listeners(&self) {
        let keys: Vec<String> = {
            let mut listeners = self.inner.listeners();
            let keys: Vec<String> = listeners.data.keys().chain(listeners.revalidate.keys()).cloned().collect();
            listeners.data.clear();
            listeners.revalidate.clear();
            keys
        };

        for key in keys {
            self.inner.released(&key);
        }
    }

    /// Number of listeners (data and revalidate) attached to `key`.
    #[must_use]
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner.listeners().count(key)
    }

    /// Listen for writes to `key`.
    pub fn on_data(
        &self,
        key: impl Into<String>,
        listener: impl Fn(&CacheEntry) + Send + Sync + 'static,
    ) -> Subscription {
        let key = key.into();
        let mut listeners = self.inner.listeners();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .data
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            cache: Arc::downgrade(&self.inner),
            key,
            id,
            kind: ListenerKind::Data,
        }
    }

    /// Listen for revalidation of `key`.
    pub fn on_revalidate(
        &self,
        key: impl Into<String>,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        let key = key.into();
        let mut listeners = self.inner.listeners();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .revalidate
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            cache: Arc::downgrade(&self.inner),
            key,
            id,
            kind: ListenerKind::Revalidate,
        }
    }

    fn emit_data(&self, key: &str, entry: &CacheEntry) {
        let snapshot: SmallVec<[DataListener; 4]> = self
            .inner
            .listeners()
            .data
            .get(key)
            .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            listener(entry);
        }
    }

    fn emit_revalidate(&self, key: &str) {
        let snapshot: SmallVec<[RevalidateListener; 4]> = self
            .inner
            .listeners()
            .revalidate
            .get(key)
            .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            listener(key);
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}
