//! Per-key queue records.
//!
//! One [`QueueState`] exists per queue key, created lazily on first submission
//! and kept (even when empty) for the life of the dispatcher so that "is a
//! request for this key running" is always answerable.

use courier_core::{AbortController, RequestDescriptor, RequestOutcome};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Identifier of one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub(crate) u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Sender side of a request's completion, shared by joined handles.
pub(crate) type Completion = Arc<watch::Sender<Option<RequestOutcome>>>;

/// A request waiting for its turn.
pub(crate) struct QueuedRequest {
    pub id: RequestId,
    pub descriptor: RequestDescriptor,
    /// Retries performed so far
    pub retries: u32,
    /// Earliest start (retry delay or debounce window)
    pub not_before: Option<Instant>,
    pub controller: Arc<AbortController>,
    pub completion: Completion,
}

impl QueuedRequest {
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|deadline| deadline <= now)
    }
}

/// A request whose adapter call is in flight.
pub(crate) struct RunningRequest {
    pub id: RequestId,
    pub cache_key: String,
    pub deduplicate: bool,
    pub controller: Arc<AbortController>,
    pub completion: Completion,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub pending: VecDeque<QueuedRequest>,
    pub running: Vec<RunningRequest>,
    pub stopped: bool,
}

impl QueueState {
    /// Pending or running request a deduplicating submission can join.
    pub fn find_duplicate(&self, cache_key: &str) -> Option<(RequestId, Completion)> {
        self.running
            .iter()
            .find(|r| r.deduplicate && r.cache_key == cache_key)
            .map(|r| (r.id, Arc::clone(&r.completion)))
            .or_else(|| {
                self.pending
                    .iter()
                    .find(|q| q.descriptor.deduplicate() && q.descriptor.cache_key() == cache_key)
                    .map(|q| (q.id, Arc::clone(&q.completion)))
            })
    }

    /// Pending debounced request whose window is still open.
    pub fn open_debounce_slot(&mut self, now: Instant) -> Option<&mut QueuedRequest> {
        self.pending.iter_mut().find(|q| {
            q.descriptor.debounce() && q.retries == 0 && q.not_before.is_some_and(|deadline| deadline > now)
        })
    }

    /// Whether the head may start given what is already running.
    pub fn head_may_start(&self) -> bool {
        self.pending
            .front()
            .is_some_and(|head| self.running.is_empty() || head.descriptor.concurrent())
    }

    pub fn snapshot(&self, queue_key: &str) -> QueueSnapshot {
        QueueSnapshot {
            queue_key: queue_key.to_owned(),
            pending: self.pending.iter().map(|q| q.id).collect(),
            running: self.running.iter().map(|r| r.id).collect(),
            stopped: self.stopped,
        }
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// The queue key
    pub queue_key: String,
    /// Waiting requests in start order
    pub pending: Vec<RequestId>,
    /// Requests whose adapter call is in flight
    pub running: Vec<RequestId>,
    /// Whether new executions are blocked
    pub stopped: bool,
}
