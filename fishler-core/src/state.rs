use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::*;
use fishler_common::SessionId;
use uuid::Uuid;

/// Registry of live connections, keyed by session id.
pub struct State {
    sessions: HashMap<SessionId, Arc<Mutex<SessionState>>>,
}

pub struct SessionState {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    pub username: Option<String>,
}

impl State {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn register_session(&mut self, remote_address: SocketAddr) -> Arc<Mutex<SessionState>> {
        let id = Uuid::new_v4();
        let session = Arc::new(Mutex::new(SessionState {
            id,
            remote_address,
            username: None,
        }));
        self.sessions.insert(id, session.clone());
        debug!(session=%id, %remote_address, "session registered");
        session
    }

    pub fn remove_session(&mut self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            debug!(session=%id, "session removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
