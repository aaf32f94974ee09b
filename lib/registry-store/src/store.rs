//! Traits a coordination store backend implements

use crate::error::Result;
use crate::types::{Acl, CreateMode, EventStream, NodeWatch, Stat};
use async_trait::async_trait;
use std::time::Duration;

/// Establishes sessions against a set of store endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session, returning it with the stream of events it emits.
    ///
    /// Resolves once the handshake has either succeeded or failed.
    async fn connect(
        &self,
        endpoints: &[String],
        timeout: Duration,
    ) -> Result<(Box<dyn Session>, EventStream)>;
}

/// A live session to the coordination store
///
/// Watches armed through a session are one-shot: each fires at most once and
/// must be re-armed by the caller. Fired watches are also reported on the
/// session's event stream.
#[async_trait]
pub trait Session: Send + Sync {
    /// Store-assigned session id
    fn session_id(&self) -> i64;

    /// Create a node and return its final path.
    ///
    /// For sequential modes the returned path carries the assigned suffix.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode, acl: &[Acl])
        -> Result<String>;

    /// Delete a node; `None` deletes regardless of version
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Check existence and arm a watch that fires on creation, deletion or data change
    async fn exists_with_watch(&self, path: &str) -> Result<(Option<Stat>, NodeWatch)>;

    async fn children(&self, path: &str) -> Result<(Vec<String>, Option<Stat>)>;

    /// List children and arm a watch that fires on the next child change or deletion
    async fn children_with_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Option<Stat>, NodeWatch)>;

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// Release the session. Consuming the box makes a second release impossible.
    async fn close(self: Box<Self>);
}
