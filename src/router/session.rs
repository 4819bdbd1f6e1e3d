use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::mcp::{FrameInlet, VirtualServer};

/// One consumer connection in stream mode. Owns its server and composer.
pub struct Session {
    pub server: Arc<VirtualServer>,
    pub inlet: FrameInlet,
    pub closed: CancellationToken,
    pub opened_at: DateTime<Utc>,
}

/// Open sessions keyed by id. Every operation is a single non-suspending critical section.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false when the id is already taken.
    pub fn insert(&self, id: String, session: Arc<Session>) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, session);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Removes the session. Only the first caller for an id gets it back.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().remove(id)
    }

    pub fn drain(&self) -> Vec<(String, Arc<Session>)> {
        self.lock().drain().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
