//! In-memory endpoint registry.

use std::collections::HashMap;

use chrono::Utc;
use reqwest::Method;
use tokio::sync::RwLock;
use tracing::info;
use url::Url;

use crate::error::{Result, WebhookError};
use crate::types::{Endpoint, EndpointId};

/// Registered endpoints, keyed by ID.
///
/// Reads hand out clones; the live map never leaves the lock.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, fill defaults, stamp timestamps and store `endpoint`.
    ///
    /// An empty ID is replaced with a generated one.
    ///
    /// # Errors
    ///
    /// `Validation` for a missing or non-HTTP URL, an unusable method, or an
    /// ID that is already registered.
    pub async fn register(&self, mut endpoint: Endpoint) -> Result<EndpointId> {
        validate(&endpoint)?;

        if endpoint.id.is_empty() {
            endpoint.id = EndpointId::generate();
        }
        endpoint.apply_defaults();
        let now = Utc::now();
        endpoint.created_at = Some(now);
        endpoint.updated_at = Some(now);

        let id = endpoint.id.clone();
        {
            let mut guard = self.endpoints.write().await;
            if guard.contains_key(&id) {
                return Err(WebhookError::validation(format!("endpoint already registered: {id}")));
            }
            guard.insert(id.clone(), endpoint);
        }

        info!(endpoint_id = %id, "endpoint registered");
        Ok(id)
    }

    /// Remove an endpoint. Deliveries already in flight are left alone.
    pub async fn unregister(&self, id: &EndpointId) -> Result<Endpoint> {
        let removed = self.endpoints.write().await.remove(id);
        match removed {
            Some(endpoint) => {
                info!(endpoint_id = %id, "endpoint unregistered");
                Ok(endpoint)
            }
            None => Err(WebhookError::endpoint_not_found(id.as_str())),
        }
    }

    pub async fn get(&self, id: &EndpointId) -> Result<Endpoint> {
        let guard = self.endpoints.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| WebhookError::endpoint_not_found(id.as_str()))
    }

    /// Replace the settings of an existing endpoint.
    ///
    /// The stored ID and creation time are kept whatever `endpoint` carries.
    pub async fn update(&self, id: &EndpointId, mut endpoint: Endpoint) -> Result<Endpoint> {
        validate(&endpoint)?;
        endpoint.apply_defaults();

        let mut guard = self.endpoints.write().await;
        let current = guard
            .get_mut(id)
            .ok_or_else(|| WebhookError::endpoint_not_found(id.as_str()))?;

        endpoint.id = current.id.clone();
        endpoint.created_at = current.created_at;
        endpoint.updated_at = Some(Utc::now());
        *current = endpoint;

        info!(endpoint_id = %id, "endpoint updated");
        Ok(current.clone())
    }

    pub async fn set_enabled(&self, id: &EndpointId, enabled: bool) -> Result<()> {
        let mut guard = self.endpoints.write().await;
        let endpoint = guard
            .get_mut(id)
            .ok_or_else(|| WebhookError::endpoint_not_found(id.as_str()))?;
        endpoint.enabled = enabled;
        endpoint.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Copy of every registered endpoint.
    pub async fn list(&self) -> Vec<Endpoint> {
        self.endpoints.read().await.values().cloned().collect()
    }

    /// Enabled endpoints subscribed to `event_type`, snapshotted under a
    /// single read lock.
    pub async fn matching(&self, event_type: &str) -> Vec<Endpoint> {
        let guard = self.endpoints.read().await;
        guard
            .values()
            .filter(|endpoint| endpoint.enabled && endpoint.matches(event_type))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }

    pub async fn enabled_count(&self) -> usize {
        self.endpoints.read().await.values().filter(|e| e.enabled).count()
    }
}

fn validate(endpoint: &Endpoint) -> Result<()> {
    if endpoint.url.trim().is_empty() {
        return Err(WebhookError::validation("endpoint url is required"));
    }

    let url = Url::parse(&endpoint.url)
        .map_err(|e| WebhookError::validation(format!("invalid endpoint url {}: {e}", endpoint.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebhookError::validation(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }

    if !endpoint.method.is_empty()
        && Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()).is_err()
    {
        return Err(WebhookError::validation(format!("invalid HTTP method: {}", endpoint.method)));
    }

    Ok(())
}
