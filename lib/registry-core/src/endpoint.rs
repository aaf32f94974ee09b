//! Endpoint management
//!
//! Providers publish themselves as nodes named `ip:port` (`[ip]:port` for
//! IPv6), so a children listing is enough to rebuild the endpoint set.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub ready: bool,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ready: true,
        }
    }

    /// Node name this endpoint is published under
    pub fn node_name(&self) -> String {
        self.to_string()
    }

    /// Parse a published node name back into an endpoint
    pub fn from_node_name(name: &str) -> Result<Self> {
        name.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidEndpoint(s.to_string());

        let (ip, port) = if let Some(rest) = s.strip_prefix('[') {
            let (ip, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (ip, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if ip.is_empty() || ip.contains('/') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Endpoint::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_node_name() {
        let endpoint = Endpoint::new("10.0.0.1", 8080);
        assert_eq!(endpoint.node_name(), "10.0.0.1:8080");
        assert_eq!(Endpoint::from_node_name("10.0.0.1:8080").unwrap(), endpoint);
    }

    #[test]
    fn test_ipv6_node_name() {
        let endpoint = Endpoint::new("fd00::1", 443);
        assert_eq!(endpoint.node_name(), "[fd00::1]:443");
        assert_eq!(Endpoint::from_node_name("[fd00::1]:443").unwrap(), endpoint);
    }

    #[test]
    fn test_hostname() {
        let endpoint: Endpoint = "backend.local:9000".parse().unwrap();
        assert_eq!(endpoint.ip, "backend.local");
        assert_eq!(endpoint.port, 9000);
        assert!(endpoint.ready);
    }

    #[test]
    fn test_invalid_node_names() {
        for name in ["", "10.0.0.1", ":80", "10.0.0.1:http", "10.0.0.1:70000", "[fd00::1]443", "0000000003"] {
            assert!(Endpoint::from_node_name(name).is_err(), "{} should be rejected", name);
        }
    }
}
