//! Response tuple, response details and the request error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sub-kind of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The connection failed or the adapter could not complete the exchange
    Network,
    /// The request was aborted through its signal
    Abort,
    /// The adapter gave up waiting for a response
    Timeout,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Abort => write!(f, "abort"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Errors captured into a [`Response`].
///
/// These never cross the dispatcher boundary as `Err` values: they are stored
/// in the cache and delivered through `on_error`/`on_finished` effects.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestError {
    /// The transport adapter failed
    #[error("Transport error ({kind}): {message}")]
    Transport {
        /// Which kind of transport failure occurred
        kind: TransportErrorKind,
        /// Human readable detail from the adapter
        message: String,
    },

    /// The descriptor is malformed (for example an unresolved endpoint param)
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The remote side answered with an error payload
    #[error("Remote error: {0}")]
    Remote(Value),
}

impl RequestError {
    /// Network-level transport failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Network,
            message: message.into(),
        }
    }

    /// Timeout transport failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Abort transport failure.
    #[must_use]
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Abort,
            message: message.into(),
        }
    }

    /// Transport sub-kind, if this is a transport failure.
    #[must_use]
    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// The `(data, error, status)` tuple produced by one request attempt.
///
/// Stored as a single value so consumers always read a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Response payload
    pub data: Option<Value>,
    /// Error payload
    pub error: Option<RequestError>,
    /// Result code reported by the transport
    pub status: Option<u16>,
}

impl Response {
    /// Successful response with a payload and status.
    #[must_use]
    pub const fn success(data: Value, status: u16) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: Some(status),
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn failure(error: RequestError, status: Option<u16>) -> Self {
        Self {
            data: None,
            error: Some(error),
            status,
        }
    }

    /// Empty response recorded for canceled requests.
    #[must_use]
    pub const fn canceled() -> Self {
        Self {
            data: None,
            error: None,
            status: None,
        }
    }

    /// Whether the attempt succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Metadata stored next to a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDetails {
    /// Number of retries performed before this result
    pub retries: u32,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// Whether the last attempt failed
    pub is_failed: bool,
    /// Whether the request was aborted by the caller
    pub is_canceled: bool,
    /// Whether the adapter reported being offline
    pub is_offline: bool,
}

impl ResponseDetails {
    /// Details for a fresh, successful result at `timestamp`.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            retries: 0,
            timestamp,
            is_failed: false,
            is_canceled: false,
            is_offline: false,
        }
    }
}

/// Terminal result of a request: the stored tuple plus its details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// The `(data, error, status)` tuple
    pub response: Response,
    /// Retry count, timestamp and flags
    pub details: ResponseDetails,
}
