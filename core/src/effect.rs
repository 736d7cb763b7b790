//! Request effects - lifecycle callbacks keyed by an effect key.
//!
//! Effects are registered by external callers (typically UI bindings) and read
//! by the dispatcher at notification time. Delivery is push-based and
//! best-effort: a notification for a key with no registered effect is dropped.
//! When several effects share a key they are invoked in registration order.
//!
//! ```
//! use courier_core::effect::{EffectRegistry, RequestEffect};
//!
//! let registry = EffectRegistry::new();
//! let id = registry.register(
//!     RequestEffect::new("GET_/users").on_start(|request| {
//!         println!("loading {}", request.endpoint());
//!     }),
//! );
//! assert_eq!(registry.len(), 1);
//! assert!(registry.unregister(id));
//! ```

use crate::descriptor::RequestDescriptor;
use crate::response::RequestOutcome;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex, PoisonError};

type DescriptorCallback = Arc<dyn Fn(&RequestDescriptor) + Send + Sync>;
type OutcomeCallback = Arc<dyn Fn(&RequestOutcome, &RequestDescriptor) + Send + Sync>;

/// A bundle of optional lifecycle callbacks.
#[derive(Clone)]
pub struct RequestEffect {
    effect_key: String,
    on_trigger: Option<DescriptorCallback>,
    on_start: Option<DescriptorCallback>,
    on_success: Option<OutcomeCallback>,
    on_error: Option<OutcomeCallback>,
    on_finished: Option<OutcomeCallback>,
}

impl RequestEffect {
    /// Effect with no callbacks for `effect_key`.
    #[must_use]
    pub fn new(effect_key: impl Into<String>) -> Self {
        Self {
            effect_key: effect_key.into(),
            on_trigger: None,
            on_start: None,
            on_success: None,
            on_error: None,
            on_finished: None,
        }
    }

    /// Called when the dispatcher picks the request up.
    #[must_use]
    pub fn on_trigger(mut self, f: impl Fn(&RequestDescriptor) + Send + Sync + 'static) -> Self {
        self.on_trigger = Some(Arc::new(f));
        self
    }

    /// Called right before the adapter is invoked.
    #[must_use]
    pub fn on_start(mut self, f: impl Fn(&RequestDescriptor) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Called on success.
    #[must_use]
    pub fn on_success(
        mut self,
        f: impl Fn(&RequestOutcome, &RequestDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called once retries are exhausted.
    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&RequestOutcome, &RequestDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called exactly once when the request settles, including cancellation.
    #[must_use]
    pub fn on_finished(
        mut self,
        f: impl Fn(&RequestOutcome, &RequestDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_finished = Some(Arc::new(f));
        self
    }

    /// The key this effect listens on.
    #[must_use]
    pub fn effect_key(&self) -> &str {
        &self.effect_key
    }

    fn trigger(&self, request: &RequestDescriptor) {
        if let Some(f) = &self.on_trigger {
            f(request);
        }
    }

    fn start(&self, request: &RequestDescriptor) {
        if let Some(f) = &self.on_start {
            f(request);
        }
    }

    fn success(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        if let Some(f) = &self.on_success {
            f(outcome, request);
        }
    }

    fn error(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        if let Some(f) = &self.on_error {
            f(outcome, request);
        }
    }

    fn finished(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        if let Some(f) = &self.on_finished {
            f(outcome, request);
        }
    }
}

impl std::fmt::Debug for RequestEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEffect")
            .field("effect_key", &self.effect_key)
            .field("on_trigger", &self.on_trigger.is_some())
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_finished", &self.on_finished.is_some())
            .finish()
    }
}

/// Opaque registration handle returned by [`EffectRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(u64);

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    effects: Vec<(EffectId, RequestEffect)>,
}

/// Live registry of request effects.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EffectRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl EffectRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an effect. Several effects may share a key.
    pub fn register(&self, effect: RequestEffect) -> EffectId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = EffectId(state.next_id);
        tracing::trace!(effect_key = %effect.effect_key, "Registered request effect");
        state.effects.push((id, effect));
        id
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unregister(&self, id: EffectId) -> bool {
        let mut state = self.lock();
        let before = state.effects.len();
        state.effects.retain(|(existing, _)| *existing != id);
        state.effects.len() != before
    }

    /// Number of registered effects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().effects.len()
    }

    /// Whether no effect is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.lock().effects.clear();
    }

    /// Snapshot of the effects registered for `effect_key`, in registration order.
    ///
    /// Callbacks run against the snapshot, so they may register or unregister
    /// effects without deadlocking.
    #[must_use]
    pub fn effects_for(&self, effect_key: &str) -> SmallVec<[RequestEffect; 4]> {
        self.lock()
            .effects
            .iter()
            .filter(|(_, effect)| effect.effect_key == effect_key)
            .map(|(_, effect)| effect.clone())
            .collect()
    }

    /// Notify `on_trigger`.
    pub fn trigger(&self, request: &RequestDescriptor) {
        for effect in self.effects_for(&request.effect_key()) {
            effect.trigger(request);
        }
    }

    /// Notify `on_start`.
    pub fn start(&self, request: &RequestDescriptor) {
        for effect in self.effects_for(&request.effect_key()) {
            effect.start(request);
        }
    }

    /// Notify `on_success`.
    pub fn success(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        for effect in self.effects_for(&request.effect_key()) {
            effect.success(outcome, request);
        }
    }

    /// Notify `on_error`.
    pub fn error(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        for effect in self.effects_for(&request.effect_key()) {
            effect.error(outcome, request);
        }
    }

    /// Notify `on_finished`.
    pub fn finished(&self, outcome: &RequestOutcome, request: &RequestDescriptor) {
        for effect in self.effects_for(&request.effect_key()) {
            effect.finished(outcome, request);
        }
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("effects", &self.len())
            .finish()
    }
}
