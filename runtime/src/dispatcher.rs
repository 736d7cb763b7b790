//! Dispatcher - per-key ordered execution of request descriptors.
//!
//! Requests are appended to the queue of their queue key. For one key at most
//! one request executes at a time unless the descriptor opts into concurrent
//! execution. Start order equals submission order, except that a failed request
//! waiting for its retry is put back at the front of its queue and so runs
//! before later submissions that have not started yet.
//!
//! Each execution step:
//!
//! 1. fires `on_trigger` then `on_start` (first attempt only, retries are silent)
//! 2. invokes the adapter, racing it against the request's abort signal
//! 3. on success writes the cache and fires `on_success` then `on_finished`
//! 4. on failure either re-enqueues at the front after the retry delay, or
//!    writes the error to the cache and fires `on_error` then `on_finished`
//! 5. on abort fires `on_finished` only, writing the cache only if the
//!    descriptor asks to cache canceled results
//! 6. frees the queue slot and starts whatever is next
//!
//! Retry and debounce timers are deadlines stored on the queued request; the
//! queue head is only started once its deadline passes. All timers go through
//! `tokio::time`, so tests drive them with tokio's paused clock.

use crate::error::DispatchError;
use crate::metrics::DispatcherMetrics;
use crate::queue::{Completion, QueueSnapshot, QueueState, QueuedRequest, RequestId, RunningRequest};
use crate::retry::RetryPolicy;
use courier_core::{
    AbortController, Adapter, AdapterResponse, Cache, EffectRegistry, RequestDescriptor,
    RequestError, RequestOutcome, ResolvedRequest, Response, ResponseDetails,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

/// Handle to a submitted request.
///
/// Returned by [`Dispatcher::add`]. Handles obtained by joining a deduplicated
/// or debounced request share the id and completion of that request.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    queue_key: String,
    cache_key: String,
    completion: watch::Receiver<Option<RequestOutcome>>,
    dispatcher: Weak<DispatcherInner>,
}

impl RequestHandle {
    /// Request id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Queue the request was submitted to.
    #[must_use]
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Cache key of the request at submission time.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Terminal outcome, if the request already settled.
    #[must_use]
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.completion.borrow().clone()
    }

    /// Wait for the terminal outcome.
    ///
    /// Returns `None` if the request was deleted from its queue (or the
    /// dispatcher was cleared) before it settled.
    pub async fn wait(&self) -> Option<RequestOutcome> {
        let mut completion = self.completion.clone();
        loop {
            let current = completion.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if completion.changed().await.is_err() {
                return completion.borrow().clone();
            }
        }
    }

    /// Abort the request. See [`Dispatcher::abort`].
    pub fn abort(&self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|inner| inner.abort(self.id))
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("queue_key", &self.queue_key)
            .field("settled", &self.completion.borrow().is_some())
            .finish_non_exhaustive()
    }
}

/// Result of one adapter attempt.
enum Attempt {
    Completed(AdapterResponse),
    Canceled,
}

pub(crate) struct DispatcherInner {
    adapter: Arc<dyn Adapter>,
    cache: Cache,
    effects: EffectRegistry,
    retry_policy: RetryPolicy,
    queues: Mutex<HashMap<String, QueueState>>,
    next_id: AtomicU64,
}

/// Per-key ordered execution engine.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher writing to `cache` and notifying `effects`.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn Adapter>,
        cache: Cache,
        effects: EffectRegistry,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                adapter,
                cache,
                effects,
                retry_policy,
                queues: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a request.
    ///
    /// Execution starts immediately if nothing else runs on the request's queue
    /// key; otherwise the request waits its turn. Transport and validation
    /// failures are reported through the handle, the cache and the effects,
    /// never as an `Err` here.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::QueueStopped`] if the queue key is stopped
    /// - [`DispatchError::RuntimeUnavailable`] if called outside a tokio runtime
    #[tracing::instrument(skip(self, descriptor), fields(queue_key = %descriptor.queue_key()), name = "dispatcher_add")]
    pub fn add(&self, descriptor: RequestDescriptor) -> Result<RequestHandle, DispatchError> {
        self.inner.add(descriptor)
    }

    /// Whether a request for `queue_key` is executing right now.
    #[must_use]
    pub fn has_running_requests(&self, queue_key: &str) -> bool {
        self.inner
            .queues()
            .get(queue_key)
            .is_some_and(|queue| !queue.running.is_empty())
    }

    /// Number of requests waiting on `queue_key`.
    #[must_use]
    pub fn pending_count(&self, queue_key: &str) -> usize {
        self.inner
            .queues()
            .get(queue_key)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Snapshot of the queue for `queue_key`, if it was ever used.
    #[must_use]
    pub fn queue(&self, queue_key: &str) -> Option<QueueSnapshot> {
        self.inner
            .queues()
            .get(queue_key)
            .map(|queue| queue.snapshot(queue_key))
    }

    /// Block new executions (and submissions) for `queue_key`.
    ///
    /// Running requests continue and queued ones stay queued.
    pub fn stop(&self, queue_key: &str) {
        self.inner
            .queues()
            .entry(queue_key.to_owned())
            .or_default()
            .stopped = true;
        tracing::debug!(queue_key, "Stopped queue");
    }

    /// Allow executions for `queue_key` again and start pending requests.
    pub fn start(&self, queue_key: &str) {
        self.inner
            .queues()
            .entry(queue_key.to_owned())
            .or_default()
            .stopped = false;
        tracing::debug!(queue_key, "Started queue");
        self.inner.flush(queue_key);
    }

    /// Whether `queue_key` is stopped.
    #[must_use]
    pub fn is_stopped(&self, queue_key: &str) -> bool {
        self.inner
            .queues()
            .get(queue_key)
            .is_some_and(|queue| queue.stopped)
    }

    /// Remove a request that has not started yet, without side effects.
    ///
    /// Returns `false` if the request is unknown, running, or waiting for a
    /// retry (it has started, so only [`abort`](Self::abort) can settle it);
    /// deleting twice is a no-op.
    pub fn delete(&self, id: RequestId) -> bool {
        let key = {
            let mut queues = self.inner.queues();
            let Some((key, queue)) = queues
                .iter_mut()
                .find(|(_, queue)| queue.pending.iter().any(|q| q.id == id && q.retries == 0))
            else {
                return false;
            };
            queue.pending.retain(|q| q.id != id);
            key.clone()
        };
        tracing::debug!(request_id = %id, queue_key = %key, "Deleted pending request");
        self.inner.flush(&key);
        true
    }

    /// Abort a pending or running request.
    ///
    /// A running request's adapter call is abandoned. Either way the request
    /// settles as canceled and `on_finished` fires exactly once.
    pub fn abort(&self, id: RequestId) -> bool {
        self.inner.abort(id)
    }

    /// Abort every pending and running request on `queue_key`.
    pub fn abort_by_key(&self, queue_key: &str) {
        let ids: Vec<RequestId> = self
            .inner
            .queues()
            .get(queue_key)
            .map(|queue| {
                queue
                    .running
                    .iter()
                    .map(|r| r.id)
                    .chain(queue.pending.iter().map(|q| q.id))
                    .collect()
            })
            .unwrap_or_default();

        for id in ids {
            self.inner.abort(id);
        }
    }

    /// Abort running requests and drop every queue record.
    ///
    /// Handles of pending requests resolve to `None`.
    pub fn clear(&self) {
        let queues = std::mem::take(&mut *self.inner.queues());
        for queue in queues.values() {
            for running in &queue.running {
                running.controller.abort();
            }
        }
        tracing::debug!(queues = queues.len(), "Cleared dispatcher");
    }

    /// Cache this dispatcher writes to.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// Effects this dispatcher notifies.
    #[must_use]
    pub fn effects(&self) -> &EffectRegistry {
        &self.inner.effects
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queues", &self.inner.queues().len())
            .finish_non_exhaustive()
    }
}

impl DispatcherInner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(self: &Arc<Self>, id: RequestId, descriptor: &RequestDescriptor, completion: &Completion) -> RequestHandle {
        RequestHandle {
            id,
            queue_key: descriptor.queue_key(),
            cache_key: descriptor.cache_key(),
            completion: completion.subscribe(),
            dispatcher: Arc::downgrade(self),
        }
    }

    fn add(self: &Arc<Self>, descriptor: RequestDescriptor) -> Result<RequestHandle, DispatchError> {
        if Handle::try_current().is_err() {
            return Err(DispatchError::RuntimeUnavailable);
        }

        let queue_key = descriptor.queue_key();
        let now = Instant::now();
        let mut queues = self.queues();
        let queue = queues.entry(queue_key.clone()).or_default();

        if queue.stopped {
            tracing::warn!(queue_key = %queue_key, "Rejected submission: queue is stopped");
            return Err(DispatchError::QueueStopped(queue_key));
        }

        if descriptor.deduplicate() {
            if let Some((id, completion)) = queue.find_duplicate(&descriptor.cache_key()) {
                tracing::debug!(request_id = %id, "Joined in-flight duplicate request");
                DispatcherMetrics::record_deduplicated();
                return Ok(self.handle(id, &descriptor, &completion));
            }
        }

        if descriptor.debounce() {
            if let Some(slot) = queue.open_debounce_slot(now) {
                let deadline = now + descriptor.debounce_time();
                slot.not_before = Some(deadline);
                let handle = self.handle(slot.id, &descriptor, &slot.completion);
                slot.descriptor = descriptor;
                drop(queues);

                tracing::debug!(request_id = %handle.id, "Debounced submission replaced pending request");
                DispatcherMetrics::record_debounced();
                self.wake_at(queue_key, deadline);
                return Ok(handle);
            }
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, _) = watch::channel(None);
        let completion: Completion = Arc::new(tx);
        let handle = self.handle(id, &descriptor, &completion);
        let not_before = descriptor.debounce().then(|| now + descriptor.debounce_time());

        queue.pending.push_back(QueuedRequest {
            id,
            descriptor,
            retries: 0,
            not_before,
            controller: Arc::new(AbortController::new()),
            completion,
        });
        let pending = queue.pending.len();
        drop(queues);

        DispatcherMetrics::record_submitted(pending);
        tracing::debug!(request_id = %id, "Queued request");

        if let Some(deadline) = not_before {
            self.wake_at(queue_key.clone(), deadline);
        }
        self.flush(&queue_key);
        Ok(handle)
    }

    /// Start every request of `queue_key` that may start now.
    fn flush(self: &Arc<Self>, queue_key: &str) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(queue_key, "No async runtime, pending requests stay queued");
            return;
        };

        loop {
            let item = {
                let mut queues = self.queues();
                let Some(queue) = queues.get_mut(queue_key) else {
                    return;
                };
                if queue.stopped || !queue.head_may_start() {
                    return;
                }
                let now = Instant::now();
                let waiting_until = queue
                    .pending
                    .front()
                    .filter(|head| !head.is_ready(now))
                    .and_then(|head| head.not_before);
                if let Some(deadline) = waiting_until {
                    drop(queues);
                    self.wake_at(queue_key.to_owned(), deadline);
                    return;
                }
                let Some(item) = queue.pending.pop_front() else {
                    return;
                };
                queue.running.push(RunningRequest {
                    id: item.id,
                    cache_key: item.descriptor.cache_key(),
                    deduplicate: item.descriptor.deduplicate(),
                    controller: Arc::clone(&item.controller),
                    completion: Arc::clone(&item.completion),
                });
                item
            };

            runtime.spawn(Arc::clone(self).execute(queue_key.to_owned(), item));
        }
    }

    /// Re-run [`flush`](Self::flush) for `queue_key` once `deadline` passes.
    fn wake_at(self: &Arc<Self>, queue_key: String, deadline: Instant) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let dispatcher = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = dispatcher.upgrade() {
                inner.flush(&queue_key);
            }
        });
    }

    async fn execute(self: Arc<Self>, queue_key: String, item: QueuedRequest) {
        let QueuedRequest {
            id,
            descriptor,
            retries,
            controller,
            completion,
            ..
        } = item;

        if retries == 0 {
            self.effects.trigger(&descriptor);
            self.effects.start(&descriptor);
        }
        DispatcherMetrics::record_started();
        tracing::debug!(request_id = %id, queue_key = %queue_key, attempt = retries, "Executing request");

        let started = Instant::now();
        let signal = controller.signal();
        let attempt = match ResolvedRequest::new(descriptor.clone()) {
            Err(error) => Attempt::Completed(Response::failure(error, None).into()),
            Ok(_) if signal.is_aborted() => Attempt::Canceled,
            Ok(request) => {
                let call = self.adapter.execute(request, signal.clone());
                tokio::select! {
                    biased;
                    () = signal.aborted() => Attempt::Canceled,
                    response = call => Attempt::Completed(response),
                }
            },
        };
        DispatcherMetrics::record_duration(started.elapsed());

        match attempt {
            Attempt::Canceled => {
                let outcome = self.cancel(id, &descriptor, retries);
                self.release(&queue_key, id);
                completion.send_replace(Some(outcome));
            },
            Attempt::Completed(result) if result.response.is_success() => {
                let outcome = RequestOutcome {
                    response: result.response,
                    details: ResponseDetails {
                        retries,
                        timestamp: self.cache.now(),
                        is_failed: false,
                        is_canceled: false,
                        is_offline: result.is_offline,
                    },
                };
                self.cache.set(&descriptor, outcome.response.clone(), outcome.details.clone());
                self.effects.success(&outcome, &descriptor);
                self.effects.finished(&outcome, &descriptor);
                DispatcherMetrics::record_success();
                tracing::debug!(request_id = %id, retries, "Request succeeded");

                self.release(&queue_key, id);
                completion.send_replace(Some(outcome));
            },
            Attempt::Completed(result) => {
                let retryable = !matches!(result.response.error, Some(RequestError::Validation(_)));
                if retryable && retries < descriptor.retry() {
                    let delay = self.retry_policy.delay_for(&descriptor, retries);
                    tracing::warn!(
                        request_id = %id,
                        attempt = retries,
                        delay_ms = delay.as_millis(),
                        error = ?result.response.error,
                        "Request failed, retrying..."
                    );
                    DispatcherMetrics::record_retry();
                    self.requeue_front(
                        &queue_key,
                        QueuedRequest {
                            id,
                            descriptor,
                            retries: retries + 1,
                            not_before: Some(Instant::now() + delay),
                            controller,
                            completion,
                        },
                    );
                } else {
                    let outcome = RequestOutcome {
                        response: result.response,
                        details: ResponseDetails {
                            retries,
                            timestamp: self.cache.now(),
                            is_failed: true,
                            is_canceled: false,
                            is_offline: result.is_offline,
                        },
                    };
                    tracing::error!(
                        request_id = %id,
                        retries,
                        error = ?outcome.response.error,
                        "Request failed"
                    );
                    self.cache.set(&descriptor, outcome.response.clone(), outcome.details.clone());
                    self.effects.error(&outcome, &descriptor);
                    self.effects.finished(&outcome, &descriptor);
                    DispatcherMetrics::record_failure();

                    self.release(&queue_key, id);
                    completion.send_replace(Some(outcome));
                }
            },
        }

        self.flush(&queue_key);
    }

    /// Free the running slot held by `id`.
    fn release(&self, queue_key: &str, id: RequestId) {
        if let Some(queue) = self.queues().get_mut(queue_key) {
            queue.running.retain(|r| r.id != id);
        }
    }

    /// Free the running slot and put the retry at the head of the queue, as
    /// one step so no later submission can slip in between.
    fn requeue_front(&self, queue_key: &str, item: QueuedRequest) {
        let mut queues = self.queues();
        if let Some(queue) = queues.get_mut(queue_key) {
            queue.running.retain(|r| r.id != item.id);
            queue.pending.push_front(item);
        }
    }

    /// Record a cancellation: optional cache write, then `on_finished`.
    fn cancel(&self, id: RequestId, descriptor: &RequestDescriptor, retries: u32) -> RequestOutcome {
        let outcome = RequestOutcome {
            response: Response::canceled(),
            details: ResponseDetails {
                retries,
                timestamp: self.cache.now(),
                is_failed: false,
                is_canceled: true,
                is_offline: false,
            },
        };
        if descriptor.cache_canceled() {
            self.cache.set(descriptor, outcome.response.clone(), outcome.details.clone());
        }
        self.effects.finished(&outcome, descriptor);
        DispatcherMetrics::record_canceled();
        tracing::debug!(request_id = %id, "Request canceled");

        outcome
    }

    fn abort(self: &Arc<Self>, id: RequestId) -> bool {
        let removed = {
            let mut queues = self.queues();
            let mut removed = None;
            for (queue_key, queue) in queues.iter_mut() {
                if let Some(position) = queue.pending.iter().position(|q| q.id == id) {
                    removed = queue
                        .pending
                        .remove(position)
                        .map(|item| (queue_key.clone(), item));
                    break;
                }
                if let Some(running) = queue.running.iter().find(|r| r.id == id) {
                    running.controller.abort();
                    return true;
                }
            }
            removed
        };

        let Some((queue_key, item)) = removed else {
            return false;
        };
        item.controller.abort();
        let outcome = self.cancel(id, &item.descriptor, item.retries);
        item.completion.send_replace(Some(outcome));
        self.flush(&queue_key);
        true
    }
}
