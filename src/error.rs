//! Error types for webhook registration and delivery.
//!
//! Validation and lookup failures surface immediately and are never retried.
//! Transport failures are retried inside the delivery client and only reach
//! the caller once the endpoint's attempt budget is spent.

use std::time::Duration;

use thiserror::Error;

use crate::stats::millis_u64;
use crate::types::DeliveryRecord;

/// Result type alias for webhook operations.
pub type Result<T> = std::result::Result<T, WebhookError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    /// Malformed input, rejected before any state changes.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Operation on an unknown identifier.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The event could not be turned into a wire payload.
    #[error("failed to build payload: {message}")]
    Transform { message: String },

    /// Network failure or non-2xx response.
    #[error("delivery failed: {message}")]
    Transport {
        status_code: Option<u16>,
        message: String,
    },

    /// A single attempt exceeded the endpoint timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The caller cancelled the delivery.
    #[error("delivery cancelled")]
    Cancelled,

    /// The dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// A component could not be built from its configuration.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// The inbound server failed to bind or serve.
    #[error("server error: {message}")]
    Server { message: String },

    /// The task surface received an operation it does not know.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl WebhookError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn endpoint_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "endpoint", id: id.into() }
    }

    pub fn delivery_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "delivery", id: id.into() }
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform { message: message.into() }
    }

    pub fn transport(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport { status_code, message: message.into() }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: millis_u64(timeout) }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server { message: message.into() }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        Self::transform(err.to_string())
    }
}

/// A delivery that ended without success.
///
/// Carries the final `failed` record alongside the error that ended it so
/// callers can inspect attempts and the last response.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct DeliveryFailure {
    pub record: Box<DeliveryRecord>,
    #[source]
    pub error: WebhookError,
}

impl DeliveryFailure {
    pub fn new(record: DeliveryRecord, error: WebhookError) -> Self {
        Self { record: Box::new(record), error }
    }

    pub fn into_record(self) -> DeliveryRecord {
        *self.record
    }
}
