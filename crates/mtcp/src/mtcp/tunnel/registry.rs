use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::mtcp::{telemetry, tunnel::connector::SharedConnector};

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub caller_id: String,
    pub caller_remote: String,
    pub connector_id: Option<String>,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FleetSnapshot {
    pub live_connectors: usize,
    pub lost_connectors: u64,
}

struct Entry {
    caller: SharedConnector,
    connector_id: Option<String>,
    started_at_unix_ms: u64,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Entry>,
    live_connectors: usize,
    lost_connectors: u64,
}

/// External callers keyed by id, plus the count of live local connectors.
/// Both are only touched while holding the one lock.
pub struct SessionRegistry {
    state: Mutex<State>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub async fn register_caller(&self, caller: &SharedConnector) {
        let mut st = self.state.lock().await;
        st.sessions.insert(
            caller.id().to_string(),
            Entry {
                caller: caller.clone(),
                connector_id: None,
                started_at_unix_ms: telemetry::now_unix_ms(),
            },
        );
    }

    /// Records the pairing. Returns false when the caller is already gone.
    pub async fn bind(&self, caller_id: &str, connector_id: &str) -> bool {
        let mut st = self.state.lock().await;
        match st.sessions.get_mut(caller_id) {
            Some(e) => {
                e.connector_id = Some(connector_id.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, caller_id: &str) -> Option<SharedConnector> {
        let mut st = self.state.lock().await;
        st.sessions.remove(caller_id).map(|e| e.caller)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Returns the number of live connectors after the increment.
    pub async fn connector_joined(&self) -> usize {
        let mut st = self.state.lock().await;
        st.live_connectors += 1;
        st.live_connectors
    }

    /// Returns the number of live connectors left after the loss.
    pub async fn connector_lost(&self) -> usize {
        let mut st = self.state.lock().await;
        st.live_connectors = st.live_connectors.saturating_sub(1);
        st.lost_connectors += 1;
        st.live_connectors
    }

    pub async fn fleet(&self) -> FleetSnapshot {
        let st = self.state.lock().await;
        FleetSnapshot {
            live_connectors: st.live_connectors,
            lost_connectors: st.lost_connectors,
        }
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let st = self.state.lock().await;
        let mut out: Vec<SessionInfo> = st
            .sessions
            .iter()
            .map(|(id, e)| SessionInfo {
                caller_id: id.clone(),
                caller_remote: e.caller.remote().to_string(),
                connector_id: e.connector_id.clone(),
                started_at_unix_ms: e.started_at_unix_ms,
            })
            .collect();
        out.sort_by(|a, b| {
            a.started_at_unix_ms
                .cmp(&b.started_at_unix_ms)
                .then_with(|| a.caller_id.cmp(&b.caller_id))
        });
        out
    }
}
