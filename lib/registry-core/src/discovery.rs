//! Service discovery on top of the registry client
//!
//! Providers of a service publish themselves as ephemeral nodes under
//! `<root>/<service>/providers`, one node per endpoint. Followers keep a
//! [`ServiceRegistry`] in sync with that directory by re-arming a children
//! watch after every change.

use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::registry::ServiceRegistry;
use registry_client::{Client, ClientError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROVIDERS: &str = "providers";
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Publishes local endpoints and follows remote services
pub struct ServiceDiscovery {
    client: Arc<Client>,
    root: String,
    registry: Arc<ServiceRegistry>,
}

impl ServiceDiscovery {
    pub fn new(client: Arc<Client>, root: impl Into<String>) -> Self {
        Self::with_registry(client, root, Arc::new(ServiceRegistry::new()))
    }

    pub fn with_registry(
        client: Arc<Client>,
        root: impl Into<String>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            client,
            root: root.into(),
            registry,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Local cache kept up to date by [`ServiceDiscovery::follow`]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Directory holding the provider nodes of `service`
    pub fn providers_path(&self, service: &str) -> Result<String> {
        if service.is_empty() || service.contains('/') {
            return Err(CoreError::InvalidServiceName(service.to_string()));
        }
        Ok(format!(
            "{}/{}/{}",
            self.root.trim_end_matches('/'),
            service,
            PROVIDERS
        ))
    }

    /// Publish `endpoint` as a provider of `service`, returning the node path.
    ///
    /// The node is ephemeral and disappears when this client's session ends.
    pub async fn publish(&self, service: &str, endpoint: &Endpoint) -> Result<String> {
        let providers = self.providers_path(service)?;
        self.client.create(&providers).await?;
        let path = self
            .client
            .register_ephemeral(&providers, &endpoint.node_name())
            .await?;
        info!(service, endpoint = %endpoint, path = %path, "published endpoint");
        Ok(path)
    }

    /// Withdraw a previously published endpoint
    pub async fn unpublish(&self, path: &str) -> Result<()> {
        self.client.delete(path).await?;
        info!(path, "withdrew endpoint");
        Ok(())
    }

    /// Read the providers of `service` once and refresh the cache.
    ///
    /// A service whose providers path is gone is dropped from the cache.
    pub async fn fetch(&self, service: &str) -> Result<Vec<Endpoint>> {
        let providers = self.providers_path(service)?;
        let endpoints = match self.client.list_children(&providers).await {
            Ok(children) => parse_providers(service, &children),
            Err(ClientError::NoChildren { .. }) => Vec::new(),
            Err(ClientError::NoSuchPath { .. }) => {
                self.registry.deregister_service(service).await?;
                return Err(CoreError::ServiceNotFound(service.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.registry.sync_endpoints(service, endpoints.clone()).await;
        Ok(endpoints)
    }

    /// Keep the cache entry for `service` in sync until the client stops
    pub fn follow(&self, service: &str) -> Result<JoinHandle<()>> {
        let path = self.providers_path(service)?;
        let client = self.client.clone();
        let registry = self.registry.clone();
        let service = service.to_string();
        Ok(tokio::spawn(follow_loop(client, registry, service, path)))
    }
}

fn parse_providers(service: &str, children: &[String]) -> Vec<Endpoint> {
    children
        .iter()
        .filter_map(|name| match Endpoint::from_node_name(name) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(service, node = %name, error = %e, "ignoring malformed provider node");
                None
            }
        })
        .collect()
}

/// Sleep for `delay`; returns false if `done` fired first
async fn sleep_or_cancel(done: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = done.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn follow_loop(
    client: Arc<Client>,
    registry: Arc<ServiceRegistry>,
    service: String,
    path: String,
) {
    let done = client.done();
    let (handle, mut changes) = client.watch_channel();
    if let Err(e) = client.register_event(&path, handle.clone()).await {
        warn!(service = %service, error = %e, "cannot follow service");
        return;
    }
    info!(service = %service, path = %path, "following service");

    loop {
        changes.drain();

        // A zero-children listing still arms the store-side watch; its firing
        // reaches us through the registered handle rather than a NodeWatch.
        let watch = match client.list_children_with_watch(&path).await {
            Ok((children, watch)) => {
                let endpoints = parse_providers(&service, &children);
                if registry.sync_endpoints(&service, endpoints).await {
                    info!(service = %service, providers = children.len(), "providers changed");
                }
                Some(watch)
            }
            Err(ClientError::NoChildren { .. }) => {
                if registry.sync_endpoints(&service, Vec::new()).await {
                    info!(service = %service, "no providers left");
                }
                None
            }
            Err(ClientError::NoSuchPath { .. }) => {
                debug!(service = %service, path = %path, "providers path missing, creating it");
                if let Err(e) = client.create(&path).await {
                    warn!(service = %service, error = %e, "cannot create providers path");
                    if !sleep_or_cancel(&done, RETRY_DELAY).await {
                        break;
                    }
                }
                continue;
            }
            Err(ClientError::NoConnection) => break,
            Err(e) => {
                warn!(service = %service, error = %e, "listing providers failed, retrying");
                if !sleep_or_cancel(&done, RETRY_DELAY).await {
                    break;
                }
                continue;
            }
        };

        let alive = match watch {
            Some(watch) => tokio::select! {
                _ = done.cancelled() => false,
                _ = watch.wait() => true,
                alive = changes.notified() => alive,
            },
            None => tokio::select! {
                _ = done.cancelled() => false,
                alive = changes.notified() => alive,
            },
        };
        if !alive {
            break;
        }
    }

    // Fails once the client has stopped, which already dropped interest in the path
    let _ = client.unregister_event(&path, &handle).await;
    info!(service = %service, "stopped following service");
}
