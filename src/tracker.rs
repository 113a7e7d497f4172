use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{DeliveryId, DeliveryRecord, DeliveryStatus, EndpointId, EventId};

/// In-memory delivery records keyed by delivery ID.
///
/// Written only by the dispatch path. Records are overwritten as a delivery
/// progresses and are never removed.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    records: RwLock<HashMap<DeliveryId, DeliveryRecord>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record.
    ///
    /// A stored record that already reached a terminal status is kept, so a
    /// late write can never move a delivery backwards.
    pub async fn record(&self, record: DeliveryRecord) {
        let mut guard = self.records.write().await;
        if let Some(existing) = guard.get(&record.id) {
            if existing.status.is_terminal() && !record.status.is_terminal() {
                return;
            }
            if existing.status != DeliveryStatus::Pending && record.status == DeliveryStatus::Pending {
                return;
            }
        }
        guard.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &DeliveryId) -> Option<DeliveryRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<DeliveryRecord> {
        self.filtered(|_| true).await
    }

    pub async fn for_event(&self, event_id: &EventId) -> Vec<DeliveryRecord> {
        self.filtered(|record| &record.event_id == event_id).await
    }

    pub async fn for_endpoint(&self, endpoint_id: &EndpointId) -> Vec<DeliveryRecord> {
        self.filtered(|record| &record.endpoint_id == endpoint_id).await
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn status_counts(&self) -> HashMap<DeliveryStatus, usize> {
        let guard = self.records.read().await;
        let mut counts = HashMap::new();
        for record in guard.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<DeliveryRecord>
    where
        F: Fn(&DeliveryRecord) -> bool,
    {
        let guard = self.records.read().await;
        guard.values().filter(|record| predicate(record)).cloned().collect()
    }
}

/// Receives intermediate delivery states while attempts are in progress.
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    async fn on_update(&self, record: &DeliveryRecord);
}

#[async_trait]
impl DeliveryObserver for DeliveryTracker {
    async fn on_update(&self, record: &DeliveryRecord) {
        self.record(record.clone()).await;
    }
}
