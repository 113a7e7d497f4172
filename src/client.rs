//! HTTP client for webhook delivery.
//!
//! One call to [`DeliveryClient::send`] is one delivery: up to
//! `max_retries` sequential attempts against a single endpoint, separated by
//! linear backoff and bounded by the caller's cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{DeliveryFailure, Result, WebhookError};
use crate::retry::RetryPolicy;
use crate::signing::Authenticator;
use crate::stats::{metric_inc, metric_latency, millis_u64, ClientStats};
use crate::tracker::DeliveryObserver;
use crate::types::{DeliveryRecord, DeliveryStatus, Endpoint, EventId};

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Ceiling applied to every backoff delay.
    pub max_retry_delay: Duration,
    /// Response bodies longer than this are cut before being recorded.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Webhook-Relay/1.0".to_string(),
            max_retry_delay: Duration::from_secs(300),
            max_response_body_bytes: 64 * 1024,
        }
    }
}

/// Bytes to deliver, already produced by a transformer.
#[derive(Debug, Clone)]
pub struct OutboundPayload {
    pub event_id: EventId,
    pub body: Bytes,
    pub content_type: String,
}

impl OutboundPayload {
    pub fn new(event_id: EventId, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            event_id,
            body: body.into(),
            content_type: content_type.into(),
        }
    }
}

/// Delivers payloads over HTTP, retrying transport failures.
///
/// Cloning is cheap and clones share the connection pool and statistics.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    authenticator: Authenticator,
    stats: Arc<RwLock<ClientStats>>,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| WebhookError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            authenticator: Authenticator,
            stats: Arc::new(RwLock::new(ClientStats::default())),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Deliver `payload` to `endpoint`, retrying until success, a
    /// non-retryable error, the attempt budget, or cancellation.
    ///
    /// Unset delivery settings on `endpoint` fall back to the registration
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryFailure`] holding the `failed` record and the
    /// last error. Cancellation during an attempt or a backoff wait yields
    /// `WebhookError::Cancelled` immediately.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &OutboundPayload,
        cancel: &CancellationToken,
    ) -> std::result::Result<DeliveryRecord, DeliveryFailure> {
        let record = DeliveryRecord::new(payload.event_id.clone(), endpoint.id.clone());
        self.deliver(record, endpoint, payload, cancel, None).await
    }

    /// Fire-and-forget variant of [`send`](Self::send).
    ///
    /// The outcome is only logged; nothing is returned to the caller.
    pub fn send_async(&self, endpoint: Endpoint, payload: OutboundPayload, cancel: CancellationToken) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(failure) = client.send(&endpoint, &payload, &cancel).await {
                warn!(
                    delivery_id = %failure.record.id,
                    endpoint_id = %endpoint.id,
                    error = %failure.error,
                    "asynchronous delivery failed"
                );
            }
        });
    }

    /// Snapshot of the delivery counters.
    pub async fn stats(&self) -> ClientStats {
        self.stats.read().await.clone()
    }

    /// Run the attempt loop for an already created record, reporting each
    /// scheduled retry to `observer`.
    pub(crate) async fn deliver(
        &self,
        mut record: DeliveryRecord,
        endpoint: &Endpoint,
        payload: &OutboundPayload,
        cancel: &CancellationToken,
        observer: Option<&dyn DeliveryObserver>,
    ) -> std::result::Result<DeliveryRecord, DeliveryFailure> {
        let mut endpoint = endpoint.clone();
        endpoint.apply_defaults();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %record.id,
            event_id = %record.event_id,
            endpoint_id = %endpoint.id,
            url = %endpoint.url
        );

        async move {
            let policy = RetryPolicy::for_endpoint(&endpoint, self.config.max_retry_delay);
            let started = Instant::now();
            let mut attempt = 0;

            let outcome = loop {
                attempt += 1;
                record.attempts = attempt;
                record.last_attempt = Some(Utc::now());

                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(WebhookError::Cancelled),
                    result = self.attempt(&endpoint, payload, &mut record) => result,
                };

                let err = match result {
                    Ok(()) => break Ok(()),
                    Err(err) => err,
                };
                if !err.is_retryable() || !policy.should_retry(attempt) {
                    break Err(err);
                }

                let delay = policy.delay_after(attempt);
                record.error = Some(err.to_string());
                record.advance(DeliveryStatus::Retrying);
                record.next_attempt = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
                metric_inc("webhook.delivery.retry_scheduled");
                if let Some(observer) = observer {
                    observer.on_update(&record).await;
                }
                warn!(
                    attempt,
                    delay_ms = millis_u64(delay),
                    error = %err,
                    "delivery attempt failed, retrying"
                );

                tokio::select! {
                    () = cancel.cancelled() => break Err(WebhookError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            };

            record.duration = started.elapsed();
            self.stats.write().await.record(outcome.is_ok(), record.duration);
            metric_latency("webhook.delivery.latency_ms", record.duration);

            match outcome {
                Ok(()) => {
                    record.error = None;
                    record.advance(DeliveryStatus::Success);
                    metric_inc("webhook.delivery.success");
                    info!(attempts = record.attempts, status_code = ?record.status_code, "webhook delivered");
                    Ok(record)
                }
                Err(err) => {
                    record.fail(&err);
                    metric_inc("webhook.delivery.failed");
                    warn!(attempts = record.attempts, error = %err, "webhook delivery failed");
                    Err(DeliveryFailure::new(record, err))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One HTTP round trip. Records status code and body on `record`.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        payload: &OutboundPayload,
        record: &mut DeliveryRecord,
    ) -> Result<()> {
        let method = Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WebhookError::validation(format!("invalid HTTP method: {}", endpoint.method)))?;

        let response = self
            .http
            .request(method, endpoint.url.as_str())
            .timeout(endpoint.timeout)
            .headers(self.request_headers(endpoint, payload))
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WebhookError::timeout(endpoint.timeout)
                } else {
                    WebhookError::transport(None, e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), attempt = record.attempts, "received response");
        record.status_code = Some(status.as_u16());
        record.response_body = Some(self.read_body(response).await);

        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::transport(
                Some(status.as_u16()),
                format!("endpoint responded with HTTP {}", status.as_u16()),
            ))
        }
    }

    /// Content type, user agent, endpoint headers, then signature headers
    /// when a secret is configured. Later entries replace earlier ones.
    fn request_headers(&self, endpoint: &Endpoint, payload: &OutboundPayload) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, CONTENT_TYPE.as_str(), &payload.content_type);
        insert_header(&mut headers, USER_AGENT.as_str(), &self.config.user_agent);

        for (name, value) in &endpoint.headers {
            insert_header(&mut headers, name, value);
        }

        if let Some(secret) = endpoint.signing_secret() {
            let signature = self.authenticator.signature_headers(&payload.body, secret);
            for (name, value) in signature.pairs() {
                insert_header(&mut headers, name, value);
            }
        }

        headers
    }

    async fn read_body(&self, response: Response) -> String {
        match response.bytes().await {
            Ok(bytes) => truncate_body(&bytes, self.config.max_response_body_bytes),
            Err(e) => {
                warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = name, "skipping invalid header"),
    }
}

fn truncate_body(bytes: &[u8], limit: usize) -> String {
    if bytes.len() > limit {
        format!("{}{TRUNCATION_SUFFIX}", String::from_utf8_lossy(&bytes[..limit]))
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
