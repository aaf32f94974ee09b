//! Registry client: connection handle, node operations and shutdown

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::metrics::RegistryMetrics;
use crate::session;
use crate::watch::{DeliveryPolicy, WatchHandle, WatchReceiver, WatchRegistry};
use registry_store::{Acl, Connector, CreateMode, NodeWatch, Session, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// State guarded by the client mutex
pub(crate) struct Inner {
    conn: Option<Box<dyn Session>>,
    pub(crate) watches: WatchRegistry,
}

impl Inner {
    fn conn(&self) -> Result<&dyn Session> {
        self.conn.as_deref().ok_or(ClientError::NoConnection)
    }
}

/// State shared between the client and its session task
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) endpoints: Vec<String>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) exit: CancellationToken,
    stopped: AtomicBool,
    pub(crate) delivery: DeliveryPolicy,
    pub(crate) metrics: RegistryMetrics,
}

impl Shared {
    /// Fire the exit signal; returns true if it had already been fired
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.exit.cancel();
        false
    }

    /// Take and close the connection; returns false if it was already gone
    pub(crate) async fn release_connection(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.conn.take() {
            Some(conn) => {
                let session_id = conn.session_id();
                conn.close().await;
                info!(client = %self.name, session_id, "store connection released");
                true
            }
            None => false,
        }
    }
}

/// Client for a hierarchical, watch-capable coordination store
///
/// A background task consumes the session's event stream, tears the client
/// down on disconnection and fans node changes out to registered watchers.
/// Every node operation fails fast with [`ClientError::NoConnection`] once the
/// client has stopped.
pub struct Client {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    session_timeout: Duration,
    watch_buffer: usize,
}

/// Connect a client with default delivery settings
pub async fn new_client(
    name: impl Into<String>,
    endpoints: Vec<String>,
    timeout_secs: u64,
    connector: &dyn Connector,
) -> Result<Client> {
    Client::connect_with(connector, ClientConfig::new(name, endpoints, timeout_secs)).await
}

fn join_node(base: &str, node: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), node)
}

impl Client {
    /// Connect to the store and start the session task.
    ///
    /// Resolves once the handshake has succeeded, or fails after the session
    /// timeout.
    pub async fn connect_with(connector: &dyn Connector, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let timeout = config.session_timeout();
        let metrics = RegistryMetrics::new()?;

        let connected =
            tokio::time::timeout(timeout, connector.connect(&config.endpoints, timeout)).await;
        let (conn, events) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(source)) => {
                metrics.observe_op("connect", false);
                return Err(ClientError::Connect {
                    endpoints: config.endpoints,
                    source,
                });
            }
            Err(_) => {
                metrics.observe_op("connect", false);
                return Err(ClientError::Connect {
                    endpoints: config.endpoints,
                    source: StoreError::Timeout(timeout),
                });
            }
        };
        metrics.observe_op("connect", true);
        info!(
            client = %config.name,
            endpoints = ?config.endpoints,
            session_id = conn.session_id(),
            "connected to store"
        );

        let shared = Arc::new(Shared {
            name: config.name,
            endpoints: config.endpoints,
            inner: Mutex::new(Inner {
                conn: Some(conn),
                watches: WatchRegistry::new(),
            }),
            exit: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            delivery: config.delivery,
            metrics,
        });

        let tracker = TaskTracker::new();
        tracker.spawn(session::run(shared.clone(), events));
        tracker.close();

        Ok(Self {
            shared,
            tracker,
            session_timeout: timeout,
            watch_buffer: config.watch_buffer,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn endpoints(&self) -> &[String] {
        &self.shared.endpoints
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn delivery(&self) -> DeliveryPolicy {
        self.shared.delivery
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.shared.metrics
    }

    /// Lock the client state unless it has been stopped
    async fn lock_live(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.shared.exit.is_cancelled() {
            return Err(ClientError::NoConnection);
        }
        Ok(self.shared.inner.lock().await)
    }

    /// Store-assigned id of the live session
    pub async fn session_id(&self) -> Option<i64> {
        let inner = self.shared.inner.lock().await;
        inner.conn.as_ref().map(|conn| conn.session_id())
    }

    pub async fn is_connected(&self) -> bool {
        match self.lock_live().await {
            Ok(inner) => inner.conn.is_some(),
            Err(_) => false,
        }
    }

    /// Create `path` and all of its ancestors as persistent nodes.
    ///
    /// Segments that already exist are skipped, so creating the same path
    /// twice succeeds.
    pub async fn create(&self, path: &str) -> Result<()> {
        debug!(client = %self.name(), path, "creating persistent path");
        self.lock_live().await?.conn()?;

        let mut segment_path = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            segment_path.push('/');
            segment_path.push_str(segment);

            let result = {
                let inner = self.lock_live().await?;
                inner
                    .conn()?
                    .create(&segment_path, &[], CreateMode::Persistent, &Acl::world_all())
                    .await
            };
            match result {
                Ok(_) => {
                    self.shared.metrics.observe_op("create", true);
                    debug!(client = %self.name(), path = %segment_path, "created node");
                }
                Err(StoreError::NodeExists) => {
                    self.shared.metrics.observe_op("create", true);
                    debug!(client = %self.name(), path = %segment_path, "node already exists");
                }
                Err(source) => {
                    self.shared.metrics.observe_op("create", false);
                    error!(client = %self.name(), path = %segment_path, error = %source, "create failed");
                    return Err(ClientError::CreatePath {
                        segment: segment_path,
                        path: path.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Delete exactly `path`, whatever its version.
    ///
    /// Fails while the node has children; deletion has to proceed leaf-first.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.delete(path, None).await
        };
        self.shared.metrics.observe_op("delete", result.is_ok());
        result.map_err(|source| {
            warn!(client = %self.name(), path, error = %source, "delete failed");
            ClientError::store("delete", path, source)
        })
    }

    /// Create `base/node` as an empty ephemeral node and return its path.
    ///
    /// An existing node is an error here, unlike in [`Client::create`].
    pub async fn register_ephemeral(&self, base: &str, node: &str) -> Result<String> {
        let path = join_node(base, node);
        let result = {
            let inner = self.lock_live().await?;
            inner
                .conn()?
                .create(&path, &[], CreateMode::Ephemeral, &Acl::world_all())
                .await
        };
        self.shared.metrics.observe_op("register_ephemeral", result.is_ok());

        match result {
            Ok(created) => {
                debug!(client = %self.name(), path = %created, "created ephemeral node");
                Ok(created)
            }
            Err(StoreError::NodeExists) => {
                error!(client = %self.name(), path = %path, "ephemeral node already exists");
                Err(ClientError::NodeExists { path })
            }
            Err(source) => {
                error!(client = %self.name(), path = %path, error = %source, "ephemeral create failed");
                Err(ClientError::store("register_ephemeral", &path, source))
            }
        }
    }

    /// Create an ephemeral, sequential node under `base` carrying `content`.
    ///
    /// Returns the full path including the store-assigned suffix.
    pub async fn register_ephemeral_sequential(&self, base: &str, content: &[u8]) -> Result<String> {
        let path = join_node(base, "");
        let result = {
            let inner = self.lock_live().await?;
            inner
                .conn()?
                .create(&path, content, CreateMode::EphemeralSequential, &Acl::world_all())
                .await
        };
        self.shared
            .metrics
            .observe_op("register_ephemeral_sequential", result.is_ok());

        match result {
            Ok(created) => {
                debug!(client = %self.name(), base, path = %created, "created sequential ephemeral node");
                Ok(created)
            }
            Err(source) => {
                error!(
                    client = %self.name(),
                    base,
                    content = %String::from_utf8_lossy(content),
                    error = %source,
                    "sequential ephemeral create failed"
                );
                Err(ClientError::store("register_ephemeral_sequential", base, source))
            }
        }
    }

    /// List the children of `path`
    pub async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.children(path).await
        };
        self.shared.metrics.observe_op("list_children", result.is_ok());

        match result {
            Ok((children, stat)) => Self::check_children(path, children, stat.is_some()),
            Err(StoreError::NoNode) => Err(ClientError::NoSuchPath {
                path: path.to_string(),
            }),
            Err(source) => {
                error!(client = %self.name(), path, error = %source, "list children failed");
                Err(ClientError::store("list_children", path, source))
            }
        }
    }

    /// List the children of `path` and arm a one-shot watch for its next change
    pub async fn list_children_with_watch(&self, path: &str) -> Result<(Vec<String>, NodeWatch)> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.children_with_watch(path).await
        };
        self.shared
            .metrics
            .observe_op("list_children_with_watch", result.is_ok());

        match result {
            Ok((children, stat, watch)) => {
                let children = Self::check_children(path, children, stat.is_some())?;
                Ok((children, watch))
            }
            Err(StoreError::NoNode) => Err(ClientError::NoSuchPath {
                path: path.to_string(),
            }),
            Err(source) => {
                error!(client = %self.name(), path, error = %source, "list children with watch failed");
                Err(ClientError::store("list_children_with_watch", path, source))
            }
        }
    }

    fn check_children(path: &str, children: Vec<String>, has_stat: bool) -> Result<Vec<String>> {
        if !has_stat {
            return Err(ClientError::NoSuchPath {
                path: path.to_string(),
            });
        }
        if children.is_empty() {
            return Err(ClientError::NoChildren {
                path: path.to_string(),
            });
        }
        Ok(children)
    }

    /// Arm a one-shot watch on an existing node
    pub async fn exists_with_watch(&self, path: &str) -> Result<NodeWatch> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.exists_with_watch(path).await
        };
        self.shared.metrics.observe_op("exists_with_watch", result.is_ok());

        match result {
            Ok((Some(_), watch)) => Ok(watch),
            Ok((None, _)) => {
                warn!(client = %self.name(), path, "watched path does not exist");
                Err(ClientError::NoSuchPath {
                    path: path.to_string(),
                })
            }
            Err(source) => {
                error!(client = %self.name(), path, error = %source, "exists with watch failed");
                Err(ClientError::store("exists_with_watch", path, source))
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.exists(path).await
        };
        self.shared.metrics.observe_op("exists", result.is_ok());
        result
            .map(|stat| stat.is_some())
            .map_err(|source| ClientError::store("exists", path, source))
    }

    /// Read the content of a node
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let result = {
            let inner = self.lock_live().await?;
            inner.conn()?.get_data(path).await
        };
        self.shared.metrics.observe_op("get_data", result.is_ok());

        match result {
            Ok((data, _)) => Ok(data),
            Err(StoreError::NoNode) => Err(ClientError::NoSuchPath {
                path: path.to_string(),
            }),
            Err(source) => Err(ClientError::store("get_data", path, source)),
        }
    }

    /// Create a watch channel sized by the client's configured buffer
    pub fn watch_channel(&self) -> (WatchHandle, WatchReceiver) {
        WatchHandle::channel(self.watch_buffer)
    }

    /// Register `handle` for changes at or below `path`.
    ///
    /// An empty path is ignored. Registering the same handle twice yields two
    /// notifications per change.
    pub async fn register_event(&self, path: &str, handle: WatchHandle) -> Result<()> {
        let mut inner = self.lock_live().await?;
        if inner.watches.register(path, handle) {
            self.shared.metrics.watched_paths.set(inner.watches.len() as i64);
            debug!(client = %self.name(), path, watchers = inner.watches.watcher_count(path), "registered watcher");
        }
        Ok(())
    }

    /// Remove one registration of `handle` from `path`; returns whether one existed
    pub async fn unregister_event(&self, path: &str, handle: &WatchHandle) -> Result<bool> {
        let mut inner = self.lock_live().await?;
        let removed = inner.watches.unregister(path, handle);
        self.shared.metrics.watched_paths.set(inner.watches.len() as i64);
        debug!(client = %self.name(), path, removed, "unregistered watcher");
        Ok(removed)
    }

    pub async fn is_watched(&self, path: &str) -> bool {
        self.shared.inner.lock().await.watches.is_watched(path)
    }

    pub async fn watcher_count(&self, path: &str) -> usize {
        self.shared.inner.lock().await.watches.watcher_count(path)
    }

    /// Signal fired once the client stops, whatever the cause
    pub fn done(&self) -> CancellationToken {
        self.shared.exit.clone()
    }

    /// Fire the exit signal; returns true if the client was already stopped
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    /// Stop the client, wait for the session task to exit, then release the connection.
    ///
    /// The connection is released only after the task has exited, since the
    /// task releases it itself on disconnection. Calling this again is a no-op.
    pub async fn close(&self) {
        self.stop();
        self.tracker.wait().await;
        self.shared.release_connection().await;
        warn!(client = %self.name(), endpoints = ?self.endpoints(), "registry client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The session task observes this and exits, dropping the last handle on the connection.
        self.shared.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use registry_store::{EventType, MemoryStore, SessionState, StoreEvent};
    use std::collections::HashSet;

    const WAIT: Duration = Duration::from_secs(2);

    async fn connect(store: &MemoryStore) -> Client {
        new_client("test", vec!["127.0.0.1:2181".to_string()], 5, store)
            .await
            .expect("connect should succeed")
    }

    async fn notified(rx: &mut WatchReceiver) -> bool {
        tokio::time::timeout(WAIT, rx.notified()).await.unwrap_or(false)
    }

    async fn inject(client: &Client, store: &MemoryStore, event: StoreEvent) {
        let session_id = client.session_id().await.expect("live session");
        assert!(store.inject_event(session_id, event));
    }

    #[tokio::test]
    async fn test_connect() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        assert_eq!(client.name(), "test");
        assert_eq!(client.endpoints(), ["127.0.0.1:2181".to_string()]);
        assert_eq!(client.session_timeout(), Duration::from_secs(5));
        assert_eq!(client.delivery(), DeliveryPolicy::Coalesce);
        assert!(client.is_connected().await);
        assert_eq!(store.live_sessions(), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let result = new_client("test", vec!["127.0.0.1:2181".to_string()], 1, &store).await;
        match result {
            Err(ClientError::Connect { source, .. }) => {
                assert!(matches!(source, StoreError::Timeout(_)))
            }
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let store = MemoryStore::new();
        let result = new_client("test", vec![], 5, &store).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let client = connect(&store).await;

        client.create("/a/b/c").await.expect("first create");
        client.create("/a/b/c").await.expect("second create");
        for path in ["/a", "/a/b", "/a/b/c"] {
            assert!(store.node_exists(path), "{} should exist", path);
        }
        assert_eq!(client.list_children("/a").await.unwrap(), vec!["b".to_string()]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_create_annotates_failure() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/a").await.unwrap();

        store.fail_next(StoreError::ConnectionLoss);
        match client.create("/a/b").await {
            Err(ClientError::CreatePath { segment, path, source }) => {
                assert_eq!(segment, "/a");
                assert_eq!(path, "/a/b");
                assert_eq!(source, StoreError::ConnectionLoss);
            }
            other => panic!("expected create failure, got {:?}", other),
        }
        assert!(!store.node_exists("/a/b"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_delete_is_leaf_first() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/parent/child").await.unwrap();

        let err = client.delete("/parent").await.unwrap_err();
        assert_eq!(err.store_error(), Some(&StoreError::NotEmpty));

        client.delete("/parent/child").await.expect("delete child");
        client.delete("/parent").await.expect("delete parent");
        assert!(!store.node_exists("/parent"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_register_ephemeral() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/svc/providers").await.unwrap();

        let path = client
            .register_ephemeral("/svc/providers/", "10.0.0.1:8080")
            .await
            .expect("register");
        assert_eq!(path, "/svc/providers/10.0.0.1:8080");

        let again = client.register_ephemeral("/svc/providers", "10.0.0.1:8080").await;
        assert!(matches!(again, Err(ClientError::NodeExists { .. })));

        let orphan = client.register_ephemeral("/missing", "node").await;
        assert_eq!(
            orphan.unwrap_err().store_error(),
            Some(&StoreError::NoNode)
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_sequential_paths_are_unique() {
        let store = MemoryStore::new();
        let client = Arc::new(connect(&store).await);
        client.create("/base").await.unwrap();

        let calls = (0..16).map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .register_ephemeral_sequential("/base", b"content")
                    .await
            })
        });
        let paths: Vec<String> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.expect("task").expect("register"))
            .collect();

        let unique: HashSet<&String> = paths.iter().collect();
        assert_eq!(unique.len(), 16);
        assert!(paths.iter().all(|p| p.starts_with("/base/")));
        client.close().await;
    }

    #[tokio::test]
    async fn test_list_children_distinguishes_absence() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/empty").await.unwrap();

        let missing = client.list_children("/missing").await.unwrap_err();
        assert!(matches!(missing, ClientError::NoSuchPath { .. }));
        assert!(missing.is_absent());

        let empty = client.list_children("/empty").await.unwrap_err();
        assert!(matches!(empty, ClientError::NoChildren { .. }));
        assert!(empty.is_absent());

        let watched = client.list_children_with_watch("/empty").await;
        assert!(matches!(watched, Err(ClientError::NoChildren { .. })));
        client.close().await;
    }

    #[tokio::test]
    async fn test_children_watch_fires_on_change() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/w/first").await.unwrap();

        let (children, watch) = client.list_children_with_watch("/w").await.unwrap();
        assert_eq!(children, vec!["first".to_string()]);

        client.create("/w/second").await.unwrap();
        let event = tokio::time::timeout(WAIT, watch.wait())
            .await
            .expect("watch fired in time")
            .expect("watch event");
        assert_eq!(event.event_type, EventType::NodeChildrenChanged);
        client.close().await;
    }

    #[tokio::test]
    async fn test_exists_with_watch() {
        let store = MemoryStore::new();
        let client = connect(&store).await;

        let missing = client.exists_with_watch("/node").await;
        assert!(matches!(missing, Err(ClientError::NoSuchPath { .. })));

        client.create("/node").await.unwrap();
        let watch = client.exists_with_watch("/node").await.unwrap();
        client.delete("/node").await.unwrap();
        let event = tokio::time::timeout(WAIT, watch.wait()).await.unwrap().unwrap();
        assert_eq!(event.event_type, EventType::NodeDeleted);
        assert!(!client.exists("/node").await.unwrap());
        client.close().await;
    }

    #[tokio::test]
    async fn test_get_data() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/svc").await.unwrap();
        let path = client.register_ephemeral_sequential("/svc", b"v1").await.unwrap();

        assert_eq!(client.get_data(&path).await.unwrap(), b"v1".to_vec());
        assert!(matches!(
            client.get_data("/svc/none").await,
            Err(ClientError::NoSuchPath { .. })
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn test_watch_fan_out_by_prefix() {
        let store = MemoryStore::new();
        let client = connect(&store).await;

        let (first, mut rx_first) = client.watch_channel();
        let (second, mut rx_second) = client.watch_channel();
        let (nested, mut rx_nested) = client.watch_channel();
        client.register_event("/a", first).await.unwrap();
        client.register_event("/a", second).await.unwrap();
        client.register_event("/a/b", nested).await.unwrap();

        inject(&client, &store, StoreEvent::node(EventType::NodeDataChanged, "/a/b/c")).await;

        assert!(notified(&mut rx_first).await);
        assert!(notified(&mut rx_second).await);
        assert!(notified(&mut rx_nested).await);
        client.close().await;
    }

    #[tokio::test]
    async fn test_armed_watch_reaches_registered_handles() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        let other = connect(&store).await;
        client.create("/svc/providers").await.unwrap();

        let (handle, mut rx) = client.watch_channel();
        client.register_event("/svc/providers", handle).await.unwrap();
        // Arms the store-side watch even though the listing itself reports no children
        let _ = client.list_children_with_watch("/svc/providers").await;

        other
            .register_ephemeral("/svc/providers", "10.0.0.2:9000")
            .await
            .unwrap();
        assert!(notified(&mut rx).await);

        other.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_unregister_stops_notifications() {
        let store = MemoryStore::new();
        let client = connect(&store).await;

        let (removed, mut rx_removed) = client.watch_channel();
        let (probe, mut rx_probe) = client.watch_channel();
        client.register_event("/p", removed.clone()).await.unwrap();
        assert!(client.unregister_event("/p", &removed).await.unwrap());
        assert!(!client.is_watched("/p").await);

        client.register_event("/p", probe.clone()).await.unwrap();
        inject(&client, &store, StoreEvent::node(EventType::NodeChildrenChanged, "/p")).await;

        // The probe sits on the same path, so once it fires the event has been handled
        assert!(notified(&mut rx_probe).await);
        assert!(!rx_removed.try_notified());

        assert!(client.unregister_event("/p", &probe).await.unwrap());
        assert!(!client.is_watched("/p").await);
        assert_eq!(client.watcher_count("/p").await, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_reestablished_session_notifies_all_watchers() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        let (handle, mut rx) = client.watch_channel();
        client.register_event("/x", handle).await.unwrap();

        for state in [
            SessionState::Expired,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::HasSession,
        ] {
            inject(&client, &store, StoreEvent::session(state, "127.0.0.1:2181")).await;
        }
        assert!(notified(&mut rx).await);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/services").await.unwrap();

        client.close().await;
        tokio::time::timeout(WAIT, client.close())
            .await
            .expect("second close returns promptly");

        assert!(client.stop());
        assert!(client.done().is_cancelled());
        assert!(!client.is_connected().await);
        assert_eq!(store.live_sessions(), 0);

        assert!(matches!(client.create("/x").await, Err(ClientError::NoConnection)));
        assert!(matches!(client.delete("/services").await, Err(ClientError::NoConnection)));
        assert!(matches!(
            client.list_children("/services").await,
            Err(ClientError::NoConnection)
        ));
        assert!(matches!(
            client.register_ephemeral_sequential("/services", b"v1").await,
            Err(ClientError::NoConnection)
        ));
        let (handle, _rx) = client.watch_channel();
        assert!(matches!(
            client.register_event("/services", handle.clone()).await,
            Err(ClientError::NoConnection)
        ));
        assert!(matches!(
            client.unregister_event("/services", &handle).await,
            Err(ClientError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn test_stop_reports_prior_state() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        assert!(!client.stop());
        assert!(client.stop());
        client.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        let session_id = client.session_id().await.unwrap();

        assert!(store.disconnect_session(session_id));
        tokio::time::timeout(WAIT, client.done().cancelled())
            .await
            .expect("client stops after disconnect");

        tokio::time::timeout(WAIT, async {
            while store.live_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session task releases the connection");

        assert_eq!(client.session_id().await, None);
        assert!(matches!(client.create("/x").await, Err(ClientError::NoConnection)));

        // Nothing left to release
        client.close().await;
        assert_eq!(store.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_client_releases_session() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/svc").await.unwrap();
        let path = client.register_ephemeral("/svc", "n").await.unwrap();

        drop(client);
        tokio::time::timeout(WAIT, async {
            while store.live_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dropped client releases its session");

        assert!(!store.node_exists(&path));
        assert!(store.node_exists("/svc"));
    }

    #[tokio::test]
    async fn test_expiry_removes_ephemerals() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/svc").await.unwrap();
        let path = client.register_ephemeral("/svc", "instance").await.unwrap();

        store.expire_session(client.session_id().await.unwrap());
        assert!(!store.node_exists(&path));
        assert!(store.node_exists("/svc"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_publish_list_delete_scenario() {
        let store = MemoryStore::new();
        let client = connect(&store).await;

        client.create("/services").await.unwrap();
        let path = client
            .register_ephemeral_sequential("/services", b"v1")
            .await
            .unwrap();

        let children = client.list_children("/services").await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(path, format!("/services/{}", children[0]));

        client.delete(&path).await.unwrap();
        assert!(matches!(
            client.list_children("/services").await,
            Err(ClientError::NoChildren { .. })
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn test_metrics_record_operations() {
        let store = MemoryStore::new();
        let client = connect(&store).await;
        client.create("/m").await.unwrap();
        let _ = client.list_children("/missing").await;

        let text = client.metrics().gather().unwrap();
        assert!(text.contains("registry_store_operations_total"));
        assert!(text.contains("op=\"create\""));
        assert!(text.contains("op=\"list_children\""));
        client.close().await;
    }

    #[test]
    fn test_join_node() {
        assert_eq!(join_node("/a", "b"), "/a/b");
        assert_eq!(join_node("/a/", "b"), "/a/b");
        assert_eq!(join_node("/a", ""), "/a/");
        assert_eq!(join_node("/", ""), "/");
    }
}
