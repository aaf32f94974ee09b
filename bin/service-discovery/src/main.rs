use anyhow::{Context, Result};
use registry_client::{Client, ClientConfig};
use registry_core::{Endpoint, ServiceDiscovery, ServiceRegistry};
use registry_store::MemoryStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

struct DaemonConfig {
    root: String,
    service: Option<String>,
    advertise: Option<Endpoint>,
    follow: Vec<String>,
}

impl DaemonConfig {
    fn from_env() -> Result<Self> {
        let advertise = match std::env::var("DISCOVERY_ADVERTISE") {
            Ok(addr) => Some(addr.parse::<Endpoint>().context("DISCOVERY_ADVERTISE")?),
            Err(_) => None,
        };
        let follow = std::env::var("DISCOVERY_FOLLOW")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            root: std::env::var("DISCOVERY_ROOT").unwrap_or_else(|_| "/services".to_string()),
            service: std::env::var("DISCOVERY_SERVICE").ok(),
            advertise,
            follow,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("REGISTRY_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_client_config() -> Result<ClientConfig> {
    let config = match std::env::var("DISCOVERY_CONFIG") {
        Ok(path) => ClientConfig::from_yaml_file(&path)
            .with_context(|| format!("loading client config from {}", path))?,
        Err(_) => ClientConfig::default(),
    };
    Ok(config.from_env()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-discovery daemon...");

    let client_config = load_client_config()?;
    let daemon = DaemonConfig::from_env()?;

    // No wire protocol backend yet; the daemon runs against an embedded store
    let store = MemoryStore::new();
    let client = Arc::new(Client::connect_with(&store, client_config).await?);
    let registry = Arc::new(ServiceRegistry::new());
    let discovery = ServiceDiscovery::with_registry(client.clone(), daemon.root.clone(), registry.clone());

    if let (Some(service), Some(endpoint)) = (&daemon.service, &daemon.advertise) {
        discovery.publish(service, endpoint).await?;
    } else if daemon.advertise.is_some() {
        warn!("DISCOVERY_ADVERTISE set without DISCOVERY_SERVICE, not publishing");
    }

    let mut followers = Vec::new();
    for service in &daemon.follow {
        followers.push(discovery.follow(service)?);
    }

    let done = client.done();
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = log_snapshot(&registry, &client).await {
                    error!("Error logging registry snapshot: {}", e);
                }
            }
            _ = done.cancelled() => {
                warn!("Registry session ended");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    client.close().await;
    for follower in followers {
        if let Err(e) = follower.await {
            error!("Follower task failed: {}", e);
        }
    }

    info!("service-discovery stopped");
    Ok(())
}

async fn log_snapshot(registry: &ServiceRegistry, client: &Client) -> Result<()> {
    let services = registry.list_services().await?;
    let snapshot: Vec<_> = services
        .iter()
        .map(|s| {
            json!({
                "service": s.service_id,
                "revision": s.revision,
                "updated_at": s.updated_at.to_rfc3339(),
                "endpoints": s.endpoints,
            })
        })
        .collect();

    info!(
        services = services.len(),
        snapshot = %serde_json::to_string(&snapshot)?,
        "registry snapshot"
    );
    debug!("metrics:\n{}", client.metrics().gather()?);
    Ok(())
}
