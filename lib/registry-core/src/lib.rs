//! Service discovery built on the registry client
//!
//! This library provides:
//! - Endpoint naming for provider nodes
//! - A local cache of discovered services
//! - Publishing and following services through the registry

pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod registry;

pub use discovery::ServiceDiscovery;
pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use registry::{ServiceInfo, ServiceRegistry};
