use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP method used when an endpoint does not specify one.
pub const DEFAULT_METHOD: &str = "POST";

/// Number of attempts made when an endpoint does not specify a limit.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between attempts when an endpoint does not specify one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Per-attempt timeout when an endpoint does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Subscription token that matches every event type.
pub const WILDCARD: &str = "*";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Unique identifier for an endpoint.
    ///
    /// This is a strongly-typed wrapper to avoid accidental mixing
    /// of endpoint IDs with other string identifiers.
    EndpointId
);

string_id!(
    /// Unique identifier for an event.
    EventId
);

string_id!(
    /// Unique identifier for one event-to-endpoint delivery.
    DeliveryId
);

/// Destination for webhook delivery.
///
/// An `Endpoint` describes *where* and *how* a webhook should be delivered.
/// Zero-valued fields (empty method, zero retries, zero durations) are filled
/// with defaults when the endpoint is registered, so a partially specified
/// endpoint deserialized from a task payload is valid input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    /// Assigned at registration when left empty.
    pub id: EndpointId,

    /// Target URL for webhook delivery.
    pub url: String,

    /// HTTP method, `POST` unless overridden.
    pub method: String,

    /// Subscribed event types. Empty or containing `"*"` matches everything.
    pub events: Vec<String>,

    /// Extra headers sent with every delivery.
    pub headers: HashMap<String, String>,

    /// Optional shared secret for HMAC signing.
    pub secret: Option<String>,

    pub enabled: bool,

    /// Maximum number of attempts, including the first one.
    pub max_retries: u32,

    /// Base delay of the linear backoff.
    pub retry_delay: Duration,

    /// Maximum time allowed for a single delivery attempt.
    pub timeout: Duration,

    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            id: EndpointId::default(),
            url: String::new(),
            method: String::new(),
            events: Vec::new(),
            headers: HashMap::new(),
            secret: None,
            enabled: true,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            timeout: Duration::ZERO,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Endpoint {
    /// Create an enabled endpoint subscribed to every event type.
    ///
    /// Delivery settings are left unset and receive their defaults on
    /// registration:
    /// - method: `POST`
    /// - max_retries: 3
    /// - retry_delay: 5 seconds
    /// - timeout: 30 seconds
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Use a caller-chosen identifier instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = EndpointId(id.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Subscribe to the given event types.
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set a custom timeout for delivery attempts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fill zero-valued delivery settings with their defaults.
    ///
    /// Fields the caller set explicitly are never touched, which makes this
    /// idempotent.
    pub fn apply_defaults(&mut self) {
        if self.method.is_empty() {
            self.method = DEFAULT_METHOD.to_string();
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
    }

    /// Whether this endpoint subscribes to `event_type`.
    ///
    /// Matching is exact and case-sensitive. The only pattern understood is
    /// the bare `"*"` token; `"user.*"` matches nothing but the literal
    /// string `"user.*"`.
    pub fn matches(&self, event_type: &str) -> bool {
        self.events.is_empty()
            || self
                .events
                .iter()
                .any(|subscribed| subscribed == WILDCARD || subscribed == event_type)
    }

    pub(crate) fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|secret| !secret.is_empty())
    }
}

/// A domain occurrence to notify endpoints about.
///
/// Events are immutable once dispatched; the dispatcher shares a single
/// instance between all deliveries it fans out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub source: String,

    pub timestamp: DateTime<Utc>,

    pub data: serde_json::Value,

    /// Header hints forwarded inside the wire envelope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Event {
    /// Create an event with a generated ID stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = EventId(id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Delivery lifecycle status for an event + endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of delivering one event to one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub status: DeliveryStatus,

    /// Number of HTTP attempts made so far.
    pub attempts: u32,

    pub last_attempt: Option<DateTime<Utc>>,

    /// Set only while the record is `retrying`.
    pub next_attempt: Option<DateTime<Utc>>,

    /// Body of the most recent response, possibly truncated.
    pub response_body: Option<String>,

    pub status_code: Option<u16>,

    /// Wall time spent on the whole attempt set, backoff included.
    pub duration: Duration,

    pub error: Option<String>,
}

impl DeliveryRecord {
    /// A fresh `pending` record with a generated ID.
    pub fn new(event_id: EventId, endpoint_id: EndpointId) -> Self {
        Self {
            id: DeliveryId::generate(),
            event_id,
            endpoint_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt: None,
            next_attempt: None,
            response_body: None,
            status_code: None,
            duration: Duration::ZERO,
            error: None,
        }
    }

    /// Move to `status`, refusing to return to `pending` or to leave a
    /// terminal state.
    pub fn advance(&mut self, status: DeliveryStatus) {
        if self.status.is_terminal() || status == DeliveryStatus::Pending {
            return;
        }
        self.status = status;
        if status != DeliveryStatus::Retrying {
            self.next_attempt = None;
        }
    }

    pub(crate) fn fail(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
        self.advance(DeliveryStatus::Failed);
    }
}
