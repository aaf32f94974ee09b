//! Client configuration loaded from YAML and the environment

use crate::error::{ClientError, Result};
use crate::watch::DeliveryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_NAME: &str = "REGISTRY_NAME";
pub const ENV_ENDPOINTS: &str = "REGISTRY_ENDPOINTS";
pub const ENV_SESSION_TIMEOUT: &str = "REGISTRY_SESSION_TIMEOUT_SECS";
pub const ENV_DELIVERY: &str = "REGISTRY_DELIVERY";

/// Registry client configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used to identify this client in logs
    pub name: String,
    /// Store endpoints, `host:port`
    pub endpoints: Vec<String>,
    /// Session timeout in seconds, also bounds the connect handshake
    pub session_timeout_secs: u64,
    /// How watch notifications reach their receivers
    pub delivery: DeliveryPolicy,
    /// Capacity of channels created by `Client::watch_channel`
    pub watch_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "registry-client".to_string(),
            endpoints: vec!["127.0.0.1:2181".to_string()],
            session_timeout_secs: 10,
            delivery: DeliveryPolicy::default(),
            watch_buffer: 8,
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, endpoints: Vec<String>, session_timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            endpoints,
            session_timeout_secs,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Overlay `REGISTRY_*` environment variables
    pub fn from_env(self) -> Result<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup`, keyed by the `REGISTRY_*` names
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_NAME) {
            self.name = name;
        }
        if let Some(endpoints) = lookup(ENV_ENDPOINTS) {
            self.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = lookup(ENV_SESSION_TIMEOUT) {
            self.session_timeout_secs = timeout.trim().parse().map_err(|_| {
                ClientError::Config(format!("{} is not a number: {}", ENV_SESSION_TIMEOUT, timeout))
            })?;
        }
        if let Some(delivery) = lookup(ENV_DELIVERY) {
            self.delivery = delivery.parse()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ClientError::Config("at least one endpoint is required".to_string()));
        }
        if self.session_timeout_secs == 0 {
            return Err(ClientError::Config("session timeout must be positive".to_string()));
        }
        if self.watch_buffer == 0 {
            return Err(ClientError::Config("watch buffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoints, vec!["127.0.0.1:2181".to_string()]);
        assert_eq!(config.session_timeout(), Duration::from_secs(10));
        assert_eq!(config.delivery, DeliveryPolicy::Coalesce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
name: gateway
endpoints:
  - zk-0:2181
  - zk-1:2181
session_timeout_secs: 30
delivery: blocking
"#;
        let config = ClientConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.name, "gateway");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.session_timeout_secs, 30);
        assert_eq!(config.delivery, DeliveryPolicy::Blocking);
        // Unspecified fields keep their defaults
        assert_eq!(config.watch_buffer, 8);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_NAME, "edge"),
            (ENV_ENDPOINTS, "a:2181, b:2181,,"),
            (ENV_SESSION_TIMEOUT, "5"),
            (ENV_DELIVERY, "coalesce"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::default()
            .apply_env_with(|key| vars.get(key).map(|v| v.to_string()))
            .expect("valid env");
        assert_eq!(config.name, "edge");
        assert_eq!(config.endpoints, vec!["a:2181".to_string(), "b:2181".to_string()]);
        assert_eq!(config.session_timeout_secs, 5);
    }

    #[test]
    fn test_env_overlay_rejects_bad_timeout() {
        let result = ClientConfig::default().apply_env_with(|key| {
            (key == ENV_SESSION_TIMEOUT).then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::new("c", vec![], 10);
        assert!(config.validate().is_err());
        config.endpoints.push("127.0.0.1:2181".to_string());
        config.session_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
