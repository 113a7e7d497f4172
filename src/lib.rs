//! An in-process webhook relay.
//!
//! Outbound, a [`DispatchManager`] keeps a registry of subscriber endpoints,
//! fans each triggered [`Event`] out to every enabled endpoint subscribed to
//! its type, and tracks one [`DeliveryRecord`] per event/endpoint pair.
//! Deliveries are signed with HMAC-SHA256 when the endpoint has a secret and
//! retried with linear backoff on transport failures.
//!
//! Inbound, an [`InboundServer`] routes webhooks sent to us by third parties
//! to registered [`InboundHandler`]s and keeps request statistics.
//!
//! ## Guarantees
//! - Deliveries for the same event are independent of each other
//! - A delivery's status only moves forward
//! - Best-effort, at-least-once delivery while the process lives
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Exactly-once delivery
//! - Payload encryption

mod client;
mod dispatcher;
mod error;
mod registry;
mod retry;
mod server;
mod signing;
mod stats;
mod task;
mod tracker;
mod transform;
mod types;

pub use client::{ClientConfig, DeliveryClient, OutboundPayload};
pub use dispatcher::{DispatchManager, ManagerConfig, ManagerStats};
pub use error::{DeliveryFailure, Result, WebhookError};
pub use registry::EndpointRegistry;
pub use retry::{backoff_delay, RetryPolicy};
pub use server::{
    handler_fn, HandlerFn, InboundHandler, InboundRequest, InboundServer, ResponseWriter, ServerConfig,
};
pub use signing::{
    is_timestamp_fresh, parse_signature_headers, verify_webhook_request, Authenticator, ParsedSignature,
    SignatureHeaders, VerificationError, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use stats::{ClientStats, ServerStats};
pub use task::{Task, TaskExecutor, TaskResult, DIRECT_EVENT_TYPE, TASK_SOURCE};
pub use tracker::{DeliveryObserver, DeliveryTracker};
pub use transform::{JsonTransformer, PayloadTransformer};
pub use types::{
    DeliveryId, DeliveryRecord, DeliveryStatus, Endpoint, EndpointId, Event, EventId, DEFAULT_MAX_RETRIES,
    DEFAULT_METHOD, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT, WILDCARD,
};
