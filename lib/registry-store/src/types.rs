//! Value types exchanged across the store boundary

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Stream of session and node events pushed by a live session
pub type EventStream = mpsc::UnboundedReceiver<StoreEvent>;

/// Connectivity state of a store session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unknown,
    Disconnected,
    Connecting,
    AuthFailed,
    ConnectedReadOnly,
    SaslAuthenticated,
    Expired,
    Connected,
    HasSession,
}

impl SessionState {
    /// Short label used for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AuthFailed => "auth_failed",
            SessionState::ConnectedReadOnly => "connected_read_only",
            SessionState::SaslAuthenticated => "sasl_authenticated",
            SessionState::Expired => "expired",
            SessionState::Connected => "connected",
            SessionState::HasSession => "has_session",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Unknown => "store state unknown",
            SessionState::Disconnected => "store disconnected",
            SessionState::Connecting => "store connecting",
            SessionState::AuthFailed => "store auth failed",
            SessionState::ConnectedReadOnly => "store connected read-only",
            SessionState::SaslAuthenticated => "store sasl authenticated",
            SessionState::Expired => "store session expired",
            SessionState::Connected => "store connected",
            SessionState::HasSession => "store has session",
        };
        f.write_str(text)
    }
}

/// Kind of event delivered on a session stream or a one-shot watch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Session,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    NotWatching,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Session => "session",
            EventType::NodeCreated => "node_created",
            EventType::NodeDeleted => "node_deleted",
            EventType::NodeDataChanged => "node_data_changed",
            EventType::NodeChildrenChanged => "node_children_changed",
            EventType::NotWatching => "not_watching",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    pub event_type: EventType,
    /// Endpoint the session is attached to
    pub server: String,
    /// Node path, empty for session events
    pub path: String,
    pub state: SessionState,
    pub error: Option<String>,
}

impl StoreEvent {
    /// Create a connectivity event
    pub fn session(state: SessionState, server: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Session,
            server: server.into(),
            path: String::new(),
            state,
            error: None,
        }
    }

    /// Create a node event for `path`
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            server: String::new(),
            path: path.into(),
            state: SessionState::HasSession,
            error: None,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Node creation flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Access control entry attached to a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub perms: u32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub const PERM_READ: u32 = 1 << 0;
    pub const PERM_WRITE: u32 = 1 << 1;
    pub const PERM_CREATE: u32 = 1 << 2;
    pub const PERM_DELETE: u32 = 1 << 3;
    pub const PERM_ADMIN: u32 = 1 << 4;
    pub const PERM_ALL: u32 = 0x1f;

    /// The open ACL: anyone may do anything
    pub fn world_all() -> Vec<Acl> {
        vec![Acl {
            perms: Self::PERM_ALL,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }]
    }
}

/// Node metadata returned by reads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Transaction id that created the node
    pub czxid: i64,
    /// Transaction id that last modified the node
    pub mzxid: i64,
    pub version: i32,
    /// Number of changes to the children of this node
    pub cversion: i32,
    /// Owning session id for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

impl Stat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// Store-side half of a one-shot watch
#[derive(Debug)]
pub struct WatchTrigger {
    tx: oneshot::Sender<StoreEvent>,
}

impl WatchTrigger {
    /// Fire the watch. A dropped receiver is not an error.
    pub fn fire(self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}

/// Caller-side half of a one-shot watch; resolves at most once
#[derive(Debug)]
pub struct NodeWatch {
    rx: oneshot::Receiver<StoreEvent>,
}

impl NodeWatch {
    pub fn channel() -> (WatchTrigger, NodeWatch) {
        let (tx, rx) = oneshot::channel();
        (WatchTrigger { tx }, NodeWatch { rx })
    }

    /// Wait for the watch to fire.
    ///
    /// Returns `None` when the store dropped the watch without firing it,
    /// which happens when the owning session goes away.
    pub async fn wait(self) -> Option<StoreEvent> {
        self.rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }

    #[test]
    fn test_world_acl() {
        let acl = Acl::world_all();
        assert_eq!(acl.len(), 1);
        assert_eq!(acl[0].perms, Acl::PERM_ALL);
        assert_eq!(acl[0].scheme, "world");
        assert_eq!(acl[0].id, "anyone");
    }

    #[test]
    fn test_session_event_has_empty_path() {
        let event = StoreEvent::session(SessionState::Connected, "127.0.0.1:2181");
        assert_eq!(event.event_type, EventType::Session);
        assert!(event.path.is_empty());
        assert_eq!(event.server, "127.0.0.1:2181");
    }

    #[tokio::test]
    async fn test_node_watch_fires_once() {
        let (trigger, watch) = NodeWatch::channel();
        trigger.fire(StoreEvent::node(EventType::NodeDeleted, "/a"));
        let event = watch.wait().await.expect("watch should fire");
        assert_eq!(event.event_type, EventType::NodeDeleted);
        assert_eq!(event.path, "/a");
    }

    #[tokio::test]
    async fn test_node_watch_dropped_trigger() {
        let (trigger, watch) = NodeWatch::channel();
        drop(trigger);
        assert!(watch.wait().await.is_none());
    }
}
