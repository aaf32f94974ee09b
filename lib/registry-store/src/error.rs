use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures reported by a coordination store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node already exists")]
    NodeExists,

    #[error("node does not exist")]
    NoNode,

    #[error("node has children")]
    NotEmpty,

    #[error("version conflict")]
    BadVersion,

    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection to the store was lost")]
    ConnectionLoss,

    #[error("session has expired")]
    SessionExpired,

    #[error("session is closed")]
    Closed,

    #[error("no store endpoint answered within {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Other(String),
}
