//! Watch registry: path-prefix fan-out of change notifications
//!
//! Callers register a [`WatchHandle`] against a path. When the store reports a
//! change at some path, every handle registered under a path that is a plain
//! string prefix of it is notified. Prefix matching is not segment-aware, so a
//! watch on `/svc` also sees changes under `/svc2`.

use crate::error::ClientError;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// How a notification reaches a receiver
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait for buffer space. A receiver that stops draining stalls every
    /// registry operation on the client until it resumes.
    Blocking,
    /// Never wait: when the receiver's buffer is full a notification is
    /// already pending, so the new one is folded into it.
    #[default]
    Coalesce,
}

impl FromStr for DeliveryPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(DeliveryPolicy::Blocking),
            "coalesce" => Ok(DeliveryPolicy::Coalesce),
            other => Err(ClientError::Config(format!("unknown delivery policy: {}", other))),
        }
    }
}

/// Sending side of a watch notification channel
///
/// Handles compare by identity: clones are equal to each other and to nothing
/// else.
#[derive(Clone, Debug)]
pub struct WatchHandle {
    id: u64,
    tx: mpsc::Sender<()>,
}

impl PartialEq for WatchHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WatchHandle {}

impl WatchHandle {
    /// Create a handle and its receiver with room for `capacity` pending notifications
    pub fn channel(capacity: usize) -> (WatchHandle, WatchReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        (WatchHandle { id, tx }, WatchReceiver { rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    async fn deliver(&self, policy: DeliveryPolicy) -> Delivery {
        match policy {
            DeliveryPolicy::Blocking => match self.tx.send(()).await {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
            DeliveryPolicy::Coalesce => match self.tx.try_send(()) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(())) => Delivery::Coalesced,
                Err(TrySendError::Closed(())) => Delivery::Closed,
            },
        }
    }
}

/// Receiving side of a watch notification channel
#[derive(Debug)]
pub struct WatchReceiver {
    rx: mpsc::Receiver<()>,
}

impl WatchReceiver {
    /// Wait for the next notification; `false` once every handle is gone
    pub async fn notified(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Consume a pending notification without waiting
    pub fn try_notified(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Discard all pending notifications, returning how many there were
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Coalesced,
    Closed,
}

/// Outcome counts of one dispatch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub coalesced: usize,
    pub closed: usize,
}

impl DispatchReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Coalesced => self.coalesced += 1,
            Delivery::Closed => self.closed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.delivered + self.coalesced + self.closed
    }
}

/// Mapping from watched path to the handles registered on it, in registration order
///
/// Invariant: no entry holds an empty handle list.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: HashMap<String, Vec<WatchHandle>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handle` to the list for `path`; returns false for an empty path
    pub fn register(&mut self, path: &str, handle: WatchHandle) -> bool {
        if path.is_empty() {
            return false;
        }
        debug!(path, handle = handle.id, "registering watch");
        self.entries.entry(path.to_string()).or_default().push(handle);
        true
    }

    /// Remove the first handle identical to `handle`; returns whether one was removed
    pub fn unregister(&mut self, path: &str, handle: &WatchHandle) -> bool {
        let Some(handles) = self.entries.get_mut(path) else {
            return false;
        };
        let removed = match handles.iter().position(|h| h == handle) {
            Some(idx) => {
                handles.remove(idx);
                true
            }
            None => false,
        };
        debug!(path, handle = handle.id, remaining = handles.len(), "unregistered watch");
        if handles.is_empty() {
            self.entries.remove(path);
        }
        removed
    }

    pub fn is_watched(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn watcher_count(&self, path: &str) -> usize {
        self.entries.get(path).map(Vec::len).unwrap_or(0)
    }

    /// Identities of the handles on `path`, in notification order
    pub fn watcher_ids(&self, path: &str) -> Vec<u64> {
        self.entries
            .get(path)
            .map(|handles| handles.iter().map(WatchHandle::id).collect())
            .unwrap_or_default()
    }

    /// Number of watched paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Notify every handle registered under a prefix of `event_path`
    pub async fn dispatch(&self, event_path: &str, policy: DeliveryPolicy) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (path, handles) in &self.entries {
            if !event_path.starts_with(path.as_str()) {
                continue;
            }
            debug!(event_path, watch_path = %path, watchers = handles.len(), "dispatching change");
            Self::notify(path, handles, policy, &mut report).await;
        }
        report
    }

    /// Notify the handles registered exactly at `path`
    pub async fn notify_path(&self, path: &str, policy: DeliveryPolicy) -> DispatchReport {
        let mut report = DispatchReport::default();
        if let Some(handles) = self.entries.get(path) {
            Self::notify(path, handles, policy, &mut report).await;
        }
        report
    }

    /// Notify every registered handle
    pub async fn notify_all(&self, policy: DeliveryPolicy) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (path, handles) in &self.entries {
            Self::notify(path, handles, policy, &mut report).await;
        }
        report
    }

    async fn notify(
        path: &str,
        handles: &[WatchHandle],
        policy: DeliveryPolicy,
        report: &mut DispatchReport,
    ) {
        for handle in handles {
            let delivery = handle.deliver(policy).await;
            if delivery == Delivery::Closed {
                warn!(path, handle = handle.id, "watch receiver dropped, notification lost");
            }
            report.record(delivery);
        }
    }
}
