//! In-memory stand-ins for the connection, pool and catalog seams.

use crate::connection_state::{ConnectionStateMap, ConnectionStateStore};
use crate::context::QueryContext;
use crate::database::connection::{BackendId, ConnectionSource, SessionConnection};
use crate::error::{ClientError, ClientResult};
use crate::query::types::{ColumnMeta, QueryArg, ResultRow};
use crate::search_path::UserSearchPathSource;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct Script {
    statements: Vec<String>,
    prepared: Vec<String>,
    execute_failures: Vec<(String, ClientError)>,
    prepare_results: VecDeque<ClientResult<Vec<ColumnMeta>>>,
    prepare_always_fails: Option<ClientError>,
    backend_id_failures: VecDeque<ClientError>,
    rows: Vec<(String, Vec<ClientResult<ResultRow>>)>,
    hang_after_rows: bool,
    hang_on_execute: bool,
    fetched: Vec<(String, Vec<QueryArg>)>,
}

/// Scriptable connection. Clones share state, so a test can keep a handle
/// while the broker owns another.
#[derive(Debug, Clone)]
pub struct FakeConnection {
    backend_id: BackendId,
    script: Arc<Mutex<Script>>,
    broken: Arc<AtomicBool>,
}

impl FakeConnection {
    pub fn new(backend_id: BackendId) -> Self {
        Self {
            backend_id,
            script: Arc::new(Mutex::new(Script::default())),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Statements sent through `execute`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.script.lock().statements.clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.script.lock().prepared.len()
    }

    /// Queries passed to `fetch`, with their arguments.
    pub fn fetched(&self) -> Vec<(String, Vec<QueryArg>)> {
        self.script.lock().fetched.clone()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Fail every `execute` whose statement contains `pattern`.
    pub fn fail_execute_containing(&self, pattern: &str, err: ClientError) {
        self.script
            .lock()
            .execute_failures
            .push((pattern.to_string(), err));
    }

    /// Queue the result of the next `prepare`. Unqueued calls succeed with a
    /// single `value TEXT` column.
    pub fn push_prepare(&self, result: ClientResult<Vec<ColumnMeta>>) {
        self.script.lock().prepare_results.push_back(result);
    }

    pub fn always_fail_prepare(&self, err: ClientError) {
        self.script.lock().prepare_always_fails = Some(err);
    }

    pub fn fail_backend_id(&self, err: ClientError) {
        self.script.lock().backend_id_failures.push_back(err);
    }

    /// Rows returned by `fetch` for queries containing `pattern`.
    pub fn set_rows(&self, pattern: &str, rows: Vec<ClientResult<ResultRow>>) {
        self.script.lock().rows.push((pattern.to_string(), rows));
    }

    /// After the scripted rows, block forever instead of ending the stream.
    pub fn hang_after_rows(&self) {
        self.script.lock().hang_after_rows = true;
    }

    /// Every `execute` records its statement and then never completes.
    pub fn hang_on_execute(&self) {
        self.script.lock().hang_on_execute = true;
    }
}

#[async_trait]
impl SessionConnection for FakeConnection {
    async fn backend_id(&mut self) -> ClientResult<BackendId> {
        match self.script.lock().backend_id_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(self.backend_id),
        }
    }

    async fn execute(&mut self, sql: &str) -> ClientResult<()> {
        let outcome = {
            let mut script = self.script.lock();
            script.statements.push(sql.to_string());
            if script.hang_on_execute {
                None
            } else {
                Some(
                    match script
                        .execute_failures
                        .iter()
                        .find(|(pattern, _)| sql.contains(pattern.as_str()))
                    {
                        Some((_, err)) => Err(err.clone()),
                        None => Ok(()),
                    },
                )
            }
        };
        match outcome {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn prepare(&mut self, sql: &str) -> ClientResult<Vec<ColumnMeta>> {
        let mut script = self.script.lock();
        script.prepared.push(sql.to_string());
        if let Some(err) = &script.prepare_always_fails {
            return Err(err.clone());
        }
        script
            .prepare_results
            .pop_front()
            .unwrap_or_else(|| Ok(vec![ColumnMeta::new("value", "TEXT")]))
    }

    fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        args: &'a [QueryArg],
    ) -> BoxStream<'a, ClientResult<ResultRow>> {
        let mut script = self.script.lock();
        script.fetched.push((sql.to_string(), args.to_vec()));
        let rows = script
            .rows
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        let rows = stream::iter(rows);
        if script.hang_after_rows {
            rows.chain(stream::pending()).boxed()
        } else {
            rows.boxed()
        }
    }

    fn mark_broken(&mut self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

/// A fake connection leased from [`FakeSource`]. Returns to the idle list on
/// drop unless marked broken.
#[derive(Debug)]
pub struct LeasedFake {
    conn: FakeConnection,
    idle: Arc<Mutex<Vec<FakeConnection>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for LeasedFake {
    fn drop(&mut self) {
        if !self.conn.is_broken() {
            self.idle.lock().push(self.conn.clone());
        }
    }
}

#[async_trait]
impl SessionConnection for LeasedFake {
    async fn backend_id(&mut self) -> ClientResult<BackendId> {
        self.conn.backend_id().await
    }

    async fn execute(&mut self, sql: &str) -> ClientResult<()> {
        self.conn.execute(sql).await
    }

    async fn prepare(&mut self, sql: &str) -> ClientResult<Vec<ColumnMeta>> {
        self.conn.prepare(sql).await
    }

    fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        args: &'a [QueryArg],
    ) -> BoxStream<'a, ClientResult<ResultRow>> {
        self.conn.fetch(sql, args)
    }

    fn mark_broken(&mut self) {
        self.conn.mark_broken();
    }
}

/// Bounded pool of fake connections. Pre-seeded connections are handed out
/// last-in first-out; new ones get fresh backend ids from 1000 upwards.
#[derive(Debug)]
pub struct FakeSource {
    idle: Arc<Mutex<Vec<FakeConnection>>>,
    permits: Arc<Semaphore>,
    next_backend_id: Mutex<BackendId>,
    leases: AtomicUsize,
    stale: AtomicUsize,
}

impl FakeSource {
    pub fn new(capacity: usize) -> Self {
        Self::with_connections(capacity, Vec::new())
    }

    pub fn with_connections(capacity: usize, connections: Vec<FakeConnection>) -> Self {
        Self {
            idle: Arc::new(Mutex::new(connections)),
            permits: Arc::new(Semaphore::new(capacity)),
            next_backend_id: Mutex::new(1000),
            leases: AtomicUsize::new(0),
            stale: AtomicUsize::new(0),
        }
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn stale_count(&self) -> usize {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Drop every idle connection, as an idle timeout would.
    pub fn take_idle(&self) -> Vec<FakeConnection> {
        std::mem::take(&mut *self.idle.lock())
    }

    /// Add an already-open connection to the idle list.
    pub fn add_idle(&self, conn: FakeConnection) {
        self.idle.lock().push(conn);
    }
}

#[async_trait]
impl ConnectionSource for FakeSource {
    type Connection = LeasedFake;

    async fn lease(&self, ctx: &QueryContext) -> ClientResult<LeasedFake> {
        let permits = Arc::clone(&self.permits);
        let permit = ctx
            .run(async move {
                permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::PoolError("pool is closed".to_string()))
            })
            .await?;

        self.leases.fetch_add(1, Ordering::SeqCst);
        let conn = self.idle.lock().pop().unwrap_or_else(|| {
            let mut next = self.next_backend_id.lock();
            *next += 1;
            FakeConnection::new(*next)
        });
        Ok(LeasedFake {
            conn,
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::SeqCst);
    }
}

/// Catalog snapshots served in order; the last one repeats.
#[derive(Debug)]
pub struct FakeStateStore {
    snapshots: Mutex<VecDeque<ClientResult<ConnectionStateMap>>>,
    loads: AtomicUsize,
}

impl FakeStateStore {
    pub fn new(states: ConnectionStateMap) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::from([Ok(states)])),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: ClientError) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::from([Err(err)])),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, states: ConnectionStateMap) {
        self.snapshots.lock().push_back(Ok(states));
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionStateStore for FakeStateStore {
    async fn load_states(&self, ctx: &QueryContext) -> ClientResult<ConnectionStateMap> {
        ctx.check()?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() > 1 {
            snapshots
                .pop_front()
                .unwrap_or_else(|| Ok(ConnectionStateMap::default()))
        } else {
            snapshots
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(ConnectionStateMap::default()))
        }
    }
}

#[derive(Debug)]
pub struct FakeSearchPathSource {
    search_path: Mutex<Vec<String>>,
    loads: AtomicUsize,
}

impl FakeSearchPathSource {
    pub fn new(search_path: Vec<String>) -> Self {
        Self {
            search_path: Mutex::new(search_path),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, search_path: Vec<String>) {
        *self.search_path.lock() = search_path;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserSearchPathSource for FakeSearchPathSource {
    async fn load_user_search_path(&self, _ctx: &QueryContext) -> ClientResult<Vec<String>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.search_path.lock().clone())
    }
}
