//! Event to wire-payload conversion.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::SecondsFormat;
use serde::Serialize;

use crate::error::Result;
use crate::types::{Endpoint, Event, EventId};

/// Turns an event into the bytes sent to an endpoint.
///
/// Implementations must be pure: no I/O and no shared mutable state, since
/// the dispatcher calls them concurrently from every delivery task.
pub trait PayloadTransformer: Send + Sync {
    fn transform(&self, event: &Event, endpoint: &Endpoint) -> Result<Bytes>;

    /// Content type of the bytes produced by [`transform`](Self::transform).
    fn content_type(&self) -> &str;
}

/// Serializes the canonical JSON envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransformer;

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a EventId,
    #[serde(rename = "type")]
    event_type: &'a str,
    source: &'a str,
    timestamp: String,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<&'a BTreeMap<String, String>>,
}

impl PayloadTransformer for JsonTransformer {
    fn transform(&self, event: &Event, _endpoint: &Endpoint) -> Result<Bytes> {
        let envelope = Envelope {
            id: &event.id,
            event_type: &event.event_type,
            source: &event.source,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            data: &event.data,
            headers: (!event.headers.is_empty()).then_some(&event.headers),
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}
