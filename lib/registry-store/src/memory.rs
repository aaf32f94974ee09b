//! In-process coordination store
//!
//! `MemoryStore` keeps a node tree shared by every session connected through
//! it and implements the same contract a networked store offers:
//! - ephemeral nodes belong to the creating session and vanish with it
//! - sequential nodes get a ten digit, per-parent, monotonically increasing suffix
//! - watches are one-shot and are also reported on the owning session's stream
//! - deleting a node with children fails
//!
//! It also exposes fault injection (expiry, disconnects, injected events and
//! failures) for exercising session handling.

use crate::error::{Result, StoreError};
use crate::store::{Connector, Session};
use crate::types::{
    Acl, CreateMode, EventStream, EventType, NodeWatch, SessionState, Stat, StoreEvent,
    WatchTrigger,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const ROOT: &str = "/";

/// Shared in-memory node tree; clones observe the same tree
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

struct Node {
    data: Vec<u8>,
    stat: Stat,
    /// Next suffix handed to a sequential child
    sequence: i32,
}

struct SessionEntry {
    server: String,
    events: mpsc::UnboundedSender<StoreEvent>,
    expired: bool,
}

type Watches = HashMap<String, Vec<(i64, WatchTrigger)>>;

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<i64, SessionEntry>,
    next_session_id: i64,
    zxid: i64,
    exists_watches: Watches,
    child_watches: Watches,
    failures: VecDeque<StoreError>,
    unreachable: bool,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
                sequence: 0,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session_id: 1,
            zxid: 0,
            exists_watches: HashMap::new(),
            child_watches: HashMap::new(),
            failures: VecDeque::new(),
            unreachable: false,
        }
    }
}

/// Split `path` into its parent and final segment
fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => (ROOT, &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (ROOT, path),
    }
}

/// Node data length as recorded in `Stat`
fn data_length(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| StoreError::Other(format!("node data too large: {} bytes", len)))
}

fn validate_path(path: &str, sequential: bool) -> Result<()> {
    if !path.starts_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    if path == ROOT {
        return Ok(());
    }
    // A sequential create may end in '/', the suffix then forms the last segment
    let body = if sequential {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    };
    if body.is_empty() || body[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl Tree {
    fn check_session(&mut self, session_id: i64) -> Result<()> {
        match self.sessions.get(&session_id) {
            None => Err(StoreError::Closed),
            Some(entry) if entry.expired => Err(StoreError::SessionExpired),
            Some(_) => match self.failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == ROOT {
            ROOT.to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire(&mut self, child_watch: bool, path: &str, event_type: EventType) {
        let watches = if child_watch {
            self.child_watches.remove(path)
        } else {
            self.exists_watches.remove(path)
        };
        for (session_id, trigger) in watches.unwrap_or_default() {
            let event = match self.sessions.get(&session_id) {
                Some(entry) => {
                    let event = StoreEvent::node(event_type, path).with_server(entry.server.clone());
                    let _ = entry.events.send(event.clone());
                    event
                }
                None => StoreEvent::node(event_type, path),
            };
            trigger.fire(event);
        }
    }

    fn create(
        &mut self,
        session_id: i64,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        validate_path(path, mode.is_sequential())?;
        if path == ROOT && !mode.is_sequential() {
            return Err(StoreError::NodeExists);
        }
        let data_length = data_length(data.len())?;

        let (parent_path, _) = split_parent(path);
        let parent_path = parent_path.to_string();
        let parent = self.nodes.get_mut(&parent_path).ok_or(StoreError::NoNode)?;
        if parent.stat.is_ephemeral() {
            return Err(StoreError::NoChildrenForEphemerals);
        }

        let final_path = if mode.is_sequential() {
            let suffixed = format!("{}{:010}", path, parent.sequence);
            parent.sequence += 1;
            suffixed
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&final_path) {
            return Err(StoreError::NodeExists);
        }

        self.zxid += 1;
        let zxid = self.zxid;
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children += 1;
            parent.stat.mzxid = zxid;
        }
        self.nodes.insert(
            final_path.clone(),
            Node {
                data: data.to_vec(),
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    version: 0,
                    cversion: 0,
                    ephemeral_owner: if mode.is_ephemeral() { session_id } else { 0 },
                    data_length,
                    num_children: 0,
                },
                sequence: 0,
            },
        );

        self.fire(false, &final_path, EventType::NodeCreated);
        self.fire(true, &parent_path, EventType::NodeChildrenChanged);
        Ok(final_path)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> Result<()> {
        validate_path(path, false)?;
        if path == ROOT {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let node = self.nodes.get(path).ok_or(StoreError::NoNode)?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(StoreError::BadVersion);
            }
        }
        if node.stat.num_children > 0 {
            return Err(StoreError::NotEmpty);
        }

        self.nodes.remove(path);
        self.zxid += 1;
        let zxid = self.zxid;
        let (parent_path, _) = split_parent(path);
        let parent_path = parent_path.to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children -= 1;
            parent.stat.mzxid = zxid;
        }

        self.fire(false, path, EventType::NodeDeleted);
        self.fire(true, path, EventType::NodeDeleted);
        self.fire(true, &parent_path, EventType::NodeChildrenChanged);
        Ok(())
    }

    fn arm(&mut self, child_watch: bool, session_id: i64, path: &str) -> NodeWatch {
        let (trigger, watch) = NodeWatch::channel();
        let watches = if child_watch {
            &mut self.child_watches
        } else {
            &mut self.exists_watches
        };
        watches
            .entry(path.to_string())
            .or_default()
            .push((session_id, trigger));
        watch
    }

    /// Delete every ephemeral owned by the session and drop its pending watches
    fn purge_session(&mut self, session_id: i64) {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session_id)
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort_by(|a, b| b.len().cmp(&a.len()));
        for path in owned {
            let _ = self.delete(&path, None);
        }

        for watches in [&mut self.exists_watches, &mut self.child_watches] {
            for triggers in watches.values_mut() {
                triggers.retain(|(owner, _)| *owner != session_id);
            }
            watches.retain(|_, triggers| !triggers.is_empty());
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of sessions that are open, expired ones included
    pub fn session_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of sessions that have not been closed
    pub fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Make subsequent connects fail as if no endpoint answered
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Fail the next session operation with `err`
    pub fn fail_next(&self, err: StoreError) {
        self.lock().failures.push_back(err);
    }

    /// Expire a session: its ephemerals are removed and it observes `Expired`
    pub fn expire_session(&self, session_id: i64) -> bool {
        let mut tree = self.lock();
        let Some(entry) = tree.sessions.get_mut(&session_id) else {
            return false;
        };
        entry.expired = true;
        let event = StoreEvent::session(SessionState::Expired, entry.server.clone())
            .with_error("session timed out");
        let _ = entry.events.send(event);
        tree.purge_session(session_id);
        debug!(session_id, "memory store expired session");
        true
    }

    /// Push a `Disconnected` state onto a session's event stream
    pub fn disconnect_session(&self, session_id: i64) -> bool {
        let tree = self.lock();
        match tree.sessions.get(&session_id) {
            Some(entry) => entry
                .events
                .send(StoreEvent::session(
                    SessionState::Disconnected,
                    entry.server.clone(),
                ))
                .is_ok(),
            None => false,
        }
    }

    /// Deliver an arbitrary event on a session's stream
    pub fn inject_event(&self, session_id: i64, event: StoreEvent) -> bool {
        let tree = self.lock();
        tree.sessions
            .get(&session_id)
            .map(|entry| entry.events.send(event).is_ok())
            .unwrap_or(false)
    }

    fn close_session(&self, session_id: i64) {
        let mut tree = self.lock();
        if tree.sessions.remove(&session_id).is_none() {
            return;
        }
        tree.purge_session(session_id);
        debug!(session_id, "memory store closed session");
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(
        &self,
        endpoints: &[String],
        timeout: Duration,
    ) -> Result<(Box<dyn Session>, EventStream)> {
        let server = endpoints
            .first()
            .cloned()
            .ok_or_else(|| StoreError::Other("no endpoints given".to_string()))?;

        let mut tree = self.lock();
        if tree.unreachable {
            return Err(StoreError::Timeout(timeout));
        }

        let session_id = tree.next_session_id;
        tree.next_session_id += 1;

        let (events, stream) = mpsc::unbounded_channel();
        for state in [
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::HasSession,
        ] {
            let _ = events.send(StoreEvent::session(state, server.clone()));
        }
        tree.sessions.insert(
            session_id,
            SessionEntry {
                server: server.clone(),
                events,
                expired: false,
            },
        );
        debug!(session_id, server = %server, "memory store opened session");

        Ok((
            Box::new(MemorySession {
                store: self.clone(),
                session_id,
            }),
            stream,
        ))
    }
}

/// A session opened against a `MemoryStore`
pub struct MemorySession {
    store: MemoryStore,
    session_id: i64,
}

#[async_trait]
impl Session for MemorySession {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        _acl: &[Acl],
    ) -> Result<String> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        tree.create(self.session_id, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        tree.delete(path, version)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        validate_path(path, false)?;
        Ok(tree.nodes.get(path).map(|node| node.stat.clone()))
    }

    async fn exists_with_watch(&self, path: &str) -> Result<(Option<Stat>, NodeWatch)> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        validate_path(path, false)?;
        let stat = tree.nodes.get(path).map(|node| node.stat.clone());
        let watch = tree.arm(false, self.session_id, path);
        Ok((stat, watch))
    }

    async fn children(&self, path: &str) -> Result<(Vec<String>, Option<Stat>)> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        validate_path(path, false)?;
        let stat = tree
            .nodes
            .get(path)
            .map(|node| node.stat.clone())
            .ok_or(StoreError::NoNode)?;
        Ok((tree.children_of(path), Some(stat)))
    }

    async fn children_with_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Option<Stat>, NodeWatch)> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        validate_path(path, false)?;
        let stat = tree
            .nodes
            .get(path)
            .map(|node| node.stat.clone())
            .ok_or(StoreError::NoNode)?;
        let children = tree.children_of(path);
        let watch = tree.arm(true, self.session_id, path);
        Ok((children, Some(stat), watch))
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let mut tree = self.store.lock();
        tree.check_session(self.session_id)?;
        validate_path(path, false)?;
        tree.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat.clone()))
            .ok_or(StoreError::NoNode)
    }

    async fn close(self: Box<Self>) {
        drop(self);
    }
}

// Also covers sessions dropped without close, as happens when a client is dropped
impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.close_session(self.session_id);
    }
}
