//! Local cache of discovered services and their endpoints

use crate::{CoreError, Endpoint, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// ServiceRegistry maintains the last known endpoints of each followed service
pub struct ServiceRegistry {
    // Map of service name to its discovered state
    services: Arc<RwLock<HashMap<String, ServiceInfo>>>,
}

/// Information about a discovered service
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub service_id: String,
    pub endpoints: Vec<Endpoint>,
    /// Bumped every time the endpoint set changes
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get service information
    pub async fn get_service(&self, service_id: &str) -> Result<ServiceInfo> {
        let services = self.services.read().await;
        services
            .get(service_id)
            .cloned()
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))
    }

    /// Get endpoints for a service
    pub async fn get_endpoints(&self, service_id: &str) -> Result<Vec<Endpoint>> {
        let service = self.get_service(service_id).await?;
        Ok(service.endpoints)
    }

    /// Insert or update a service, returning true if its endpoint set changed
    pub async fn sync_endpoints(&self, service_id: &str, mut endpoints: Vec<Endpoint>) -> bool {
        endpoints.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
        endpoints.dedup();

        let mut services = self.services.write().await;
        match services.get_mut(service_id) {
            Some(service) if service.endpoints == endpoints => false,
            Some(service) => {
                service.endpoints = endpoints;
                service.revision += 1;
                service.updated_at = Utc::now();
                debug!(service = service_id, revision = service.revision, "endpoints changed");
                true
            }
            None => {
                services.insert(
                    service_id.to_string(),
                    ServiceInfo {
                        service_id: service_id.to_string(),
                        endpoints,
                        revision: 1,
                        updated_at: Utc::now(),
                    },
                );
                debug!(service = service_id, "service discovered");
                true
            }
        }
    }

    /// List all services
    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self.services.read().await;
        Ok(services.values().cloned().collect())
    }

    /// Deregister a service
    pub async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        services.remove(service_id);
        debug!("Deregistered service: {}", service_id);
        Ok(())
    }

}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
