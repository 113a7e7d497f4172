//! Task-style control surface.
//!
//! External callers drive the dispatcher by submitting a named operation with
//! a JSON payload and reading back a uniform [`TaskResult`]. Failures are
//! reported in the result, never raised.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dispatcher::DispatchManager;
use crate::error::{Result, WebhookError};
use crate::types::{DeliveryStatus, Endpoint, EndpointId, Event};

/// Event type used by `send_webhook` when the payload names none.
pub const DIRECT_EVENT_TYPE: &str = "webhook.send";

/// Event source used when a task payload names none.
pub const TASK_SOURCE: &str = "task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    pub fn new(id: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(task_id: impl Into<String>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl ToString, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            data,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: Task) -> TaskResult;
}

#[async_trait]
impl TaskExecutor for DispatchManager {
    async fn execute(&self, task: Task) -> TaskResult {
        debug!(task_id = %task.id, operation = %task.operation, "executing task");

        let outcome = match task.operation.as_str() {
            "register_endpoint" => register_endpoint(self, &task.payload).await,
            "unregister_endpoint" => unregister_endpoint(self, &task.payload).await,
            "trigger_event" => trigger_event(self, &task.payload).await,
            "send_webhook" => send_webhook(self, &task.payload).await,
            other => Err(WebhookError::UnknownOperation(other.to_string())),
        };

        match outcome {
            Ok(Outcome::Done(data)) => TaskResult::ok(task.id, data),
            Ok(Outcome::Unsuccessful { data, error }) => TaskResult::failed(task.id, error, data),
            Err(err) => {
                warn!(task_id = %task.id, operation = %task.operation, error = %err, "task failed");
                TaskResult::failed(task.id, err, Value::Null)
            }
        }
    }
}

enum Outcome {
    Done(Value),
    /// The operation ran but its result counts as a failure.
    Unsuccessful { data: Value, error: String },
}

async fn register_endpoint(manager: &DispatchManager, payload: &Value) -> Result<Outcome> {
    let spec = required(payload, "endpoint")?;
    let endpoint: Endpoint = serde_json::from_value(spec.clone())
        .map_err(|e| WebhookError::validation(format!("invalid endpoint: {e}")))?;

    let id = manager.register_endpoint(endpoint).await?;
    Ok(Outcome::Done(json!({ "endpoint_id": id })))
}

async fn unregister_endpoint(manager: &DispatchManager, payload: &Value) -> Result<Outcome> {
    let id = required_str(payload, "endpoint_id")?;
    manager.unregister_endpoint(&EndpointId::from(id)).await?;
    Ok(Outcome::Done(json!({})))
}

async fn trigger_event(manager: &DispatchManager, payload: &Value) -> Result<Outcome> {
    let spec = required(payload, "event")?;
    let event_type = required_str(spec, "type")?;
    let source = spec.get("source").and_then(Value::as_str).unwrap_or(TASK_SOURCE);
    let data = spec.get("data").cloned().unwrap_or(Value::Null);

    let event = Event::new(event_type, source, data);
    let event_id = event.id.clone();
    let launched = manager.trigger_event(event).await?;
    Ok(Outcome::Done(json!({ "event_id": event_id, "deliveries": launched })))
}

async fn send_webhook(manager: &DispatchManager, payload: &Value) -> Result<Outcome> {
    let id = required_str(payload, "endpoint_id")?;
    let body = required(payload, "payload")?;

    let record = manager.send_webhook(&EndpointId::from(id), direct_event(body)).await?;
    let data = json!({
        "delivery_id": record.id,
        "status": record.status,
        "attempts": record.attempts,
    });

    if record.status == DeliveryStatus::Success {
        Ok(Outcome::Done(data))
    } else {
        let error = record
            .error
            .unwrap_or_else(|| format!("delivery {}", record.status));
        Ok(Outcome::Unsuccessful { data, error })
    }
}

/// Wrap a raw `send_webhook` payload in an event.
///
/// An object may carry its own `type`, `source` and `data`; anything else is
/// delivered whole as the event data.
fn direct_event(body: &Value) -> Event {
    let field = |name: &str| body.get(name).and_then(Value::as_str);
    let event_type = field("type").unwrap_or(DIRECT_EVENT_TYPE);
    let source = field("source").unwrap_or(TASK_SOURCE);
    let data = body.get("data").cloned().unwrap_or_else(|| body.clone());
    Event::new(event_type, source, data)
}

fn required<'a>(payload: &'a Value, field: &str) -> Result<&'a Value> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(WebhookError::validation(format!("missing required field: {field}"))),
        Some(value) => Ok(value),
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str> {
    required(payload, field)?
        .as_str()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| WebhookError::validation(format!("{field} must be a non-empty string")))
}
