//! Session state machine
//!
//! [`SessionMachine`] turns store events into a [`Transition`] describing what
//! the client must do; [`run`] is the background task that owns the event
//! stream and carries those transitions out.

use crate::client::Shared;
use registry_store::{EventStream, EventType, SessionState, StoreEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Side effect requested by a store event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The session is lost: stop the client and release the connection
    Teardown,
    /// A node changed; notify watches whose path prefixes this one
    Dispatch(String),
    /// A session was re-established after being lost; watchers must re-arm.
    /// An empty path addresses every watcher.
    Reestablished(String),
    /// Nothing to do beyond recording the state
    Track,
}

/// Connectivity tracking, independent of any store or network
#[derive(Clone, Debug)]
pub struct SessionMachine {
    state: SessionState,
    had_session: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Unknown,
            had_session: false,
        }
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded connectivity state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a session has been established at least once
    pub fn had_session(&self) -> bool {
        self.had_session
    }

    /// Apply one event and return the effect to perform.
    ///
    /// Node events do not alter the recorded connectivity state.
    pub fn on_event(&mut self, event: &StoreEvent) -> Transition {
        match event.event_type {
            EventType::NodeDataChanged | EventType::NodeChildrenChanged => {
                return Transition::Dispatch(event.path.clone());
            }
            EventType::Session => {}
            _ => return Transition::Track,
        }

        let previous = self.state;
        self.state = event.state;
        match event.state {
            SessionState::Disconnected => Transition::Teardown,
            SessionState::HasSession => {
                let reestablished = self.had_session && previous != SessionState::HasSession;
                self.had_session = true;
                if reestablished {
                    Transition::Reestablished(event.path.clone())
                } else {
                    Transition::Track
                }
            }
            _ => Transition::Track,
        }
    }
}

/// Consume session events until cancelled, disconnected, or the stream ends
pub(crate) async fn run(shared: Arc<Shared>, mut events: EventStream) {
    let mut machine = SessionMachine::new();

    loop {
        let event = tokio::select! {
            biased;

            _ = shared.exit.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            warn!(client = %shared.name, "store event stream closed, stopping client");
            shared.stop();
            break;
        };

        if event.event_type == EventType::Session {
            info!(
                client = %shared.name,
                server = %event.server,
                state = %event.state,
                error = ?event.error,
                "received session event"
            );
            shared.metrics.observe_session_event(event.state.as_str());
        } else {
            debug!(
                client = %shared.name,
                event_type = %event.event_type,
                path = %event.path,
                "received node event"
            );
        }

        match machine.on_event(&event) {
            Transition::Teardown => {
                warn!(
                    client = %shared.name,
                    endpoints = ?shared.endpoints,
                    "store disconnected, closing client"
                );
                shared.stop();
                shared.release_connection().await;
                break;
            }
            Transition::Dispatch(path) => {
                let inner = shared.inner.lock().await;
                let report = inner.watches.dispatch(&path, shared.delivery).await;
                drop(inner);
                debug!(client = %shared.name, path = %path, notified = report.total(), "node change dispatched");
                shared.metrics.observe_dispatch(&report);
            }
            Transition::Reestablished(path) => {
                let inner = shared.inner.lock().await;
                let report = if path.is_empty() {
                    inner.watches.notify_all(shared.delivery).await
                } else {
                    inner.watches.notify_path(&path, shared.delivery).await
                };
                drop(inner);
                info!(client = %shared.name, notified = report.total(), "session re-established, watchers notified");
                shared.metrics.observe_dispatch(&report);
            }
            Transition::Track => {}
        }
    }

    info!(client = %shared.name, endpoints = ?shared.endpoints, "session task finished");
}
