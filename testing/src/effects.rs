//! Lifecycle notification recorder.

use courier_core::{RequestDescriptor, RequestEffect, RequestOutcome};
use std::sync::{Arc, Mutex, PoisonError};

/// Which lifecycle callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// `on_trigger`
    Trigger,
    /// `on_start`
    Start,
    /// `on_success`
    Success,
    /// `on_error`
    Error,
    /// `on_finished`
    Finished,
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// The callback that fired
    pub event: LifecycleEvent,
    /// Cache key of the descriptor passed to the callback
    pub cache_key: String,
    /// Payload of the descriptor, useful to tell submissions apart
    pub payload: Option<serde_json::Value>,
    /// Outcome passed to the callback (success, error and finished only)
    pub outcome: Option<RequestOutcome>,
}

/// Records every notification delivered to the effects it builds.
///
/// ```
/// use courier_core::EffectRegistry;
/// use courier_testing::EffectRecorder;
///
/// let registry = EffectRegistry::new();
/// let recorder = EffectRecorder::new();
/// registry.register(recorder.effect("GET_/users"));
/// assert!(recorder.events().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct EffectRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EffectRecorder {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An effect for `effect_key` that records all five callbacks.
    #[must_use]
    pub fn effect(&self, effect_key: impl Into<String>) -> RequestEffect {
        let trigger = self.clone();
        let start = self.clone();
        let success = self.clone();
        let error = self.clone();
        let finished = self.clone();

        RequestEffect::new(effect_key)
            .on_trigger(move |request| trigger.push(LifecycleEvent::Trigger, request, None))
            .on_start(move |request| start.push(LifecycleEvent::Start, request, None))
            .on_success(move |outcome, request| success.push(LifecycleEvent::Success, request, Some(outcome)))
            .on_error(move |outcome, request| error.push(LifecycleEvent::Error, request, Some(outcome)))
            .on_finished(move |outcome, request| {
                finished.push(LifecycleEvent::Finished, request, Some(outcome));
            })
    }

    fn push(&self, event: LifecycleEvent, request: &RequestDescriptor, outcome: Option<&RequestOutcome>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                event,
                cache_key: request.cache_key(),
                payload: request.payload().cloned(),
                outcome: outcome.cloned(),
            });
    }

    /// All notifications so far, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Just the callback kinds, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> Vec<LifecycleEvent> {
        self.events().into_iter().map(|recorded| recorded.event).collect()
    }

    /// How often `event` fired.
    #[must_use]
    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.events()
            .iter()
            .filter(|recorded| recorded.event == event)
            .count()
    }

    /// Outcomes passed to `on_finished`, in delivery order.
    #[must_use]
    pub fn finished_outcomes(&self) -> Vec<RequestOutcome> {
        self.events()
            .into_iter()
            .filter(|recorded| recorded.event == LifecycleEvent::Finished)
            .filter_map(|recorded| recorded.outcome)
            .collect()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
