//! Shared map from backend identifier to [`SessionInfo`].
//!
//! The lock is held only for the lookup or insert, never across I/O. Entries
//! are replaced when a new physical connection opens ([`SessionRegistry::reset`]),
//! and removed when the pool closes a connection ([`SessionRegistry::evict`]),
//! when a session is closed as broken ([`SessionRegistry::forget`]) or when
//! the periodic reaper finds the backend gone ([`SessionRegistry::retain_live`]).

use super::database_session::SessionInfo;
use crate::database::connection::BackendId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<BackendId, Arc<SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the entry for `backend_id` and record a use.
    pub fn checkout(&self, backend_id: BackendId) -> Arc<SessionInfo> {
        let info = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(backend_id)
                    .or_insert_with(|| Arc::new(SessionInfo::new(backend_id))),
            )
        };
        info.mark_used();
        info
    }

    /// Start a fresh entry for a newly opened physical connection.
    ///
    /// Backend ids are reused by the server, so anything recorded for an
    /// earlier connection with the same id is discarded.
    pub fn reset(&self, backend_id: BackendId) -> Arc<SessionInfo> {
        let info = Arc::new(SessionInfo::new(backend_id));
        let previous = self
            .sessions
            .lock()
            .insert(backend_id, Arc::clone(&info));
        if previous.is_some() {
            debug!(backend_id = backend_id, "Replaced session entry for reused backend id");
        }
        info
    }

    pub fn get(&self, backend_id: BackendId) -> Option<Arc<SessionInfo>> {
        self.sessions.lock().get(&backend_id).cloned()
    }

    /// Forget a closed physical connection.
    pub fn evict(&self, backend_id: BackendId) -> bool {
        let removed = self.sessions.lock().remove(&backend_id).is_some();
        if removed {
            debug!(backend_id = backend_id, "Session entry evicted");
        }
        removed
    }

    /// Forget `info` if it is still the current entry for its backend.
    pub fn forget(&self, info: &Arc<SessionInfo>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&info.backend_id()) {
            Some(current) if Arc::ptr_eq(current, info) => {
                sessions.remove(&info.backend_id());
                debug!(backend_id = info.backend_id(), "Session entry dropped with broken connection");
                true
            }
            _ => false,
        }
    }

    /// Drop every entry whose backend is not in `live`. Returns how many went.
    pub fn retain_live(&self, live: &HashSet<BackendId>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|backend_id, _| live.contains(backend_id));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
