//! Session and watch lifecycle management for the service registry
//!
//! This library provides:
//! - A `Client` that owns one store session and fails fast once it is gone
//! - Node operations for persistent, ephemeral and sequential nodes
//! - A watch registry that fans node changes out by path prefix
//! - Idempotent shutdown that releases the session exactly once

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod watch;

pub use client::{new_client, Client};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use metrics::RegistryMetrics;
pub use session::{SessionMachine, Transition};
pub use watch::{DeliveryPolicy, DispatchReport, WatchHandle, WatchReceiver, WatchRegistry};

pub use registry_store::{NodeWatch, StoreError};
