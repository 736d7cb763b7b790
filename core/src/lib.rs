//! # Courier Core
//!
//! Core types for the Courier request orchestration engine.
//!
//! This crate provides the pieces that tie a call's identity to cache and
//! queue keys, independent of any transport or UI layer.
//!
//! ## Core Concepts
//!
//! - **Request Descriptor**: Immutable value describing one remote operation and its policies
//! - **Response**: The `(data, error, status)` tuple plus [`ResponseDetails`]
//! - **Request Effect**: Lifecycle callbacks registered under an effect key
//! - **Cache Store**: Keyed response storage with staleness, garbage collection and events
//! - **Adapter**: The transport contract the dispatcher invokes
//!
//! ## Example
//!
//! ```
//! use courier_core::{Cache, Method, RequestDescriptor, Response, ResponseDetails};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let cache = Cache::new();
//! let request = RequestDescriptor::new(Method::Get, "/users/:id").set_param("id", 1);
//!
//! cache.set(&request, Response::success(json!({ "name": "Ada" }), 200), ResponseDetails::new(Utc::now()));
//!
//! let entry = cache.get(&request.cache_key());
//! assert_eq!(entry.map(|e| e.response.status), Some(Some(200)));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;
pub use smallvec::{SmallVec, smallvec};

/// Transport adapter contract and abort signals
pub mod adapter;

/// Keyed response storage
pub mod cache;

/// Request descriptors and key derivation
pub mod descriptor;

/// Request effects and their registry
pub mod effect;

/// Injected dependencies (clock)
pub mod environment;

/// Response tuple, details and errors
pub mod response;

pub use adapter::{
    AbortController, AbortSignal, Adapter, AdapterResponse, ResolvedRequest, Timeout, from_fn,
};
pub use cache::{Cache, CacheEntry, Subscription, is_stale};
pub use descriptor::{Backoff, Method, RequestDescriptor};
pub use effect::{EffectId, EffectRegistry, RequestEffect};
pub use environment::{Clock, SystemClock};
pub use response::{
    RequestError, RequestOutcome, Response, ResponseDetails, TransportErrorKind,
};
