use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ClientConfig, DeliveryClient, OutboundPayload};
use crate::error::{Result, WebhookError};
use crate::registry::EndpointRegistry;
use crate::stats::{metric_inc, ClientStats};
use crate::tracker::{DeliveryObserver, DeliveryTracker};
use crate::transform::{JsonTransformer, PayloadTransformer};
use crate::types::{DeliveryId, DeliveryRecord, DeliveryStatus, Endpoint, EndpointId, Event, EventId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub client: ClientConfig,
}

/// Aggregate view over the registry, the tracker and the delivery client.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub endpoints_total: usize,
    pub endpoints_enabled: usize,
    pub deliveries_total: usize,
    pub deliveries_by_status: HashMap<DeliveryStatus, usize>,
    pub client: ClientStats,
}

/// Matches events to endpoints and fans deliveries out.
///
/// Owns the endpoint registry and the delivery tracker; each sits behind its
/// own lock and no operation holds both. Cloning is cheap and clones share
/// all state, which is how spawned delivery tasks reach the tracker.
#[derive(Clone)]
pub struct DispatchManager {
    registry: Arc<EndpointRegistry>,
    tracker: Arc<DeliveryTracker>,
    client: DeliveryClient,
    transformer: Arc<dyn PayloadTransformer>,
    shutdown: CancellationToken,
}

impl fmt::Debug for DispatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchManager")
            .field("client", &self.client)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DispatchManager {
    /// Manager delivering the canonical JSON envelope.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_transformer(config, Arc::new(JsonTransformer))
    }

    pub fn with_transformer(
        config: ManagerConfig,
        transformer: Arc<dyn PayloadTransformer>,
    ) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(EndpointRegistry::new()),
            tracker: Arc::new(DeliveryTracker::new()),
            client: DeliveryClient::new(config.client)?,
            transformer,
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn register_endpoint(&self, endpoint: Endpoint) -> Result<EndpointId> {
        self.registry.register(endpoint).await
    }

    pub async fn unregister_endpoint(&self, id: &EndpointId) -> Result<()> {
        self.registry.unregister(id).await.map(|_| ())
    }

    pub async fn get_endpoint(&self, id: &EndpointId) -> Result<Endpoint> {
        self.registry.get(id).await
    }

    pub async fn update_endpoint(&self, id: &EndpointId, endpoint: Endpoint) -> Result<Endpoint> {
        self.registry.update(id, endpoint).await
    }

    pub async fn set_endpoint_enabled(&self, id: &EndpointId, enabled: bool) -> Result<()> {
        self.registry.set_enabled(id, enabled).await
    }

    pub async fn list_endpoints(&self) -> Vec<Endpoint> {
        self.registry.list().await
    }

    /// Launch one delivery per enabled endpoint subscribed to the event's
    /// type and return without waiting for any of them.
    ///
    /// A `pending` record for every launched delivery is in the tracker by
    /// the time this returns. Deliveries are independent: they finish in any
    /// order and one failing does not affect the others.
    ///
    /// Returns the number of deliveries launched.
    pub async fn trigger_event(&self, event: Event) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Err(WebhookError::Shutdown);
        }

        let targets = self.registry.matching(&event.event_type).await;
        metric_inc("webhook.dispatch.triggered");
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = targets.len(),
            "event triggered"
        );

        let event = Arc::new(event);
        let launched = targets.len();
        for endpoint in targets {
            let record = DeliveryRecord::new(event.id.clone(), endpoint.id.clone());
            self.tracker.record(record.clone()).await;

            let manager = self.clone();
            let event = Arc::clone(&event);
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                manager.run_delivery(record, &endpoint, &event, &cancel).await;
            });
        }

        Ok(launched)
    }

    /// Deliver `event` to one endpoint and wait for the outcome.
    ///
    /// Delivery failures are reported through the returned record's status
    /// and error, not as `Err`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown endpoint, `Shutdown` after
    /// [`shutdown`](Self::shutdown).
    pub async fn send_webhook(&self, endpoint_id: &EndpointId, event: Event) -> Result<DeliveryRecord> {
        if self.shutdown.is_cancelled() {
            return Err(WebhookError::Shutdown);
        }

        let endpoint = self.registry.get(endpoint_id).await?;
        let record = DeliveryRecord::new(event.id.clone(), endpoint.id.clone());
        self.tracker.record(record.clone()).await;

        let cancel = self.shutdown.child_token();
        Ok(self.run_delivery(record, &endpoint, &event, &cancel).await)
    }

    async fn run_delivery(
        &self,
        mut record: DeliveryRecord,
        endpoint: &Endpoint,
        event: &Event,
        cancel: &CancellationToken,
    ) -> DeliveryRecord {
        let body = match self.transformer.transform(event, endpoint) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    delivery_id = %record.id,
                    endpoint_id = %endpoint.id,
                    event_id = %event.id,
                    error = %err,
                    "payload transform failed, delivery abandoned"
                );
                metric_inc("webhook.delivery.transform_failed");
                record.fail(&err);
                self.tracker.record(record.clone()).await;
                return record;
            }
        };

        let payload = OutboundPayload::new(event.id.clone(), body, self.transformer.content_type());
        let observer: &dyn DeliveryObserver = self.tracker.as_ref();
        let record = match self
            .client
            .deliver(record, endpoint, &payload, cancel, Some(observer))
            .await
        {
            Ok(record) => record,
            Err(failure) => failure.into_record(),
        };

        self.tracker.record(record.clone()).await;
        record
    }

    pub async fn delivery(&self, id: &DeliveryId) -> Result<DeliveryRecord> {
        self.tracker
            .get(id)
            .await
            .ok_or_else(|| WebhookError::delivery_not_found(id.as_str()))
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.tracker.list().await
    }

    pub async fn deliveries_for_event(&self, event_id: &EventId) -> Vec<DeliveryRecord> {
        self.tracker.for_event(event_id).await
    }

    pub async fn deliveries_for_endpoint(&self, endpoint_id: &EndpointId) -> Vec<DeliveryRecord> {
        self.tracker.for_endpoint(endpoint_id).await
    }

    pub fn client(&self) -> &DeliveryClient {
        &self.client
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            endpoints_total: self.registry.len().await,
            endpoints_enabled: self.registry.enabled_count().await,
            deliveries_total: self.tracker.len().await,
            deliveries_by_status: self.tracker.status_counts().await,
            client: self.client.stats().await,
        }
    }

    /// Stop accepting events and cancel every delivery still waiting out a
    /// backoff or an attempt.
    pub fn shutdown(&self) {
        info!("dispatch manager shutting down");
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}
