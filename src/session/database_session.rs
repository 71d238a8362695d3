//! Session value object and the per-backend facts it accumulates.

use super::registry::SessionRegistry;
use crate::database::connection::{BackendId, SessionConnection};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Facts about one physical connection, shared by every session handed out
/// for the same backend.
#[derive(Debug)]
pub struct SessionInfo {
    backend_id: BackendId,
    search_path: Mutex<Vec<String>>,
    used_count: AtomicU64,
    last_used: Mutex<Option<DateTime<Utc>>>,
    created_at: DateTime<Utc>,
    scan_metadata_watermark: AtomicI64,
}

impl SessionInfo {
    pub fn new(backend_id: BackendId) -> Self {
        Self {
            backend_id,
            search_path: Mutex::new(Vec::new()),
            used_count: AtomicU64::new(0),
            last_used: Mutex::new(None),
            created_at: Utc::now(),
            scan_metadata_watermark: AtomicI64::new(0),
        }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    /// Search path last confirmed on the connection. Empty until the first SET.
    pub fn search_path(&self) -> Vec<String> {
        self.search_path.lock().clone()
    }

    pub fn set_search_path(&self, search_path: Vec<String>) {
        *self.search_path.lock() = search_path;
    }

    pub fn used_count(&self) -> u64 {
        self.used_count.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        *self.last_used.lock()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record an acquisition. Returns the new usage count.
    pub(crate) fn mark_used(&self) -> u64 {
        let count = self.used_count.fetch_add(1, Ordering::AcqRel) + 1;
        let now = Utc::now();
        let mut last_used = self.last_used.lock();
        if last_used.map_or(true, |previous| previous < now) {
            *last_used = Some(now);
        }
        count
    }

    pub fn scan_metadata_watermark(&self) -> i64 {
        self.scan_metadata_watermark.load(Ordering::Acquire)
    }

    /// Move the watermark forward. Lower ids are ignored.
    pub fn advance_watermark(&self, id: i64) -> i64 {
        self.scan_metadata_watermark
            .fetch_max(id, Ordering::AcqRel)
            .max(id)
    }
}

/// A leased connection paired with its [`SessionInfo`].
///
/// Owned by exactly one caller. Dropping it releases the connection to the pool.
#[derive(Debug)]
pub struct DatabaseSession<C> {
    backend_id: BackendId,
    connection: C,
    info: Arc<SessionInfo>,
    registry: Option<Arc<SessionRegistry>>,
}

impl<C: SessionConnection> DatabaseSession<C> {
    pub fn new(backend_id: BackendId, connection: C, info: Arc<SessionInfo>) -> Self {
        Self {
            backend_id,
            connection,
            info,
            registry: None,
        }
    }

    /// Tie the session to the map its info came from, so closing it as
    /// broken also drops the entry.
    pub fn registered_in(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn search_path(&self) -> Vec<String> {
        self.info.search_path()
    }

    pub fn used_count(&self) -> u64 {
        self.info.used_count()
    }

    /// Close the connection instead of returning it to the pool and forget
    /// what was recorded about it.
    pub fn mark_broken(&mut self) {
        self.connection.mark_broken();
        if let Some(registry) = &self.registry {
            registry.forget(&self.info);
        }
    }
}
