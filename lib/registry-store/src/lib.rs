//! Coordination store boundary for the service registry
//!
//! This library provides:
//! - The `Connector` and `Session` traits a store backend implements
//! - Session states, node events, create modes and stat metadata
//! - An in-process `MemoryStore` that honours the store contract

pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use store::{Connector, Session};
pub use types::{
    Acl, CreateMode, EventStream, EventType, NodeWatch, SessionState, Stat, StoreEvent,
    WatchTrigger,
};
