//! # Connection Seams
//!
//! The broker, executor and retry controller only see a physical connection
//! through [`SessionConnection`] and a pool through [`ConnectionSource`]. The
//! sqlx-backed implementations below are what [`DbClient`](crate::client::DbClient)
//! wires in; tests substitute in-memory fakes.

use crate::context::QueryContext;
use crate::database::pool_stats::LeaseStats;
use crate::error::{ClientError, ClientResult};
use crate::logging;
use crate::query::conversion::{column_meta, decode_row};
use crate::query::types::{ColumnMeta, QueryArg, ResultRow};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::{Executor, Postgres, Statement};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Server-assigned identifier of a physical connection (`pg_backend_pid()`).
pub type BackendId = i32;

/// A leased physical connection.
///
/// Dropping the value releases the connection back to its pool.
#[async_trait]
pub trait SessionConnection: Send + 'static {
    /// Identifier of the backend serving this connection.
    async fn backend_id(&mut self) -> ClientResult<BackendId>;

    /// Run one or more statements without parameters, discarding results.
    async fn execute(&mut self, sql: &str) -> ClientResult<()>;

    /// Parse and describe `sql` on the server. Missing relations surface here.
    async fn prepare(&mut self, sql: &str) -> ClientResult<Vec<ColumnMeta>>;

    /// Stream converted rows of a previously prepared statement.
    fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        args: &'a [QueryArg],
    ) -> BoxStream<'a, ClientResult<ResultRow>>;

    async fn fetch_all(&mut self, sql: &str, args: &[QueryArg]) -> ClientResult<Vec<ResultRow>> {
        self.fetch(sql, args).try_collect().await
    }

    /// Close the physical connection instead of returning it to the pool.
    fn mark_broken(&mut self) {}
}

/// Something that hands out leased connections.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: SessionConnection;

    /// Lease a connection, giving up when `ctx` is cancelled or expires.
    async fn lease(&self, ctx: &QueryContext) -> ClientResult<Self::Connection>;

    /// A leased connection was found dead and discarded.
    fn record_stale(&self) {}
}

/// Pooled sqlx connection.
#[derive(Debug)]
pub struct PgSessionConnection {
    conn: PoolConnection<Postgres>,
}

impl PgSessionConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SessionConnection for PgSessionConnection {
    async fn backend_id(&mut self) -> ClientResult<BackendId> {
        fetch_backend_id(&mut self.conn).await
    }

    async fn execute(&mut self, sql: &str) -> ClientResult<()> {
        let conn: &mut sqlx::PgConnection = &mut self.conn;
        conn.execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> ClientResult<Vec<ColumnMeta>> {
        let statement = (&mut *self.conn).prepare(sql).await?;
        Ok(column_meta(statement.columns()))
    }

    fn fetch<'a>(
        &'a mut self,
        sql: &'a str,
        args: &'a [QueryArg],
    ) -> BoxStream<'a, ClientResult<ResultRow>> {
        bind_args(sqlx::query(sql), args)
            .fetch(&mut *self.conn)
            .map(|row| row.map_err(ClientError::from).and_then(|row| decode_row(&row)))
            .boxed()
    }

    fn mark_broken(&mut self) {
        self.conn.close_on_drop();
    }
}

pub(crate) async fn fetch_backend_id(conn: &mut PoolConnection<Postgres>) -> ClientResult<BackendId> {
    let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
        .fetch_one(&mut **conn)
        .await?;
    Ok(pid)
}

/// Bind positional arguments in order.
pub fn bind_args<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &'q [QueryArg],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            QueryArg::Null => query.bind(None::<String>),
            QueryArg::Bool(v) => query.bind(*v),
            QueryArg::Int(v) => query.bind(*v),
            QueryArg::Float(v) => query.bind(*v),
            QueryArg::Text(v) => query.bind(v.as_str()),
            QueryArg::Json(v) => query.bind(v),
            QueryArg::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

/// Leases from the user pool and records lease statistics.
#[derive(Debug, Clone)]
pub struct PgConnectionSource {
    pool: PgPool,
    stats: Arc<LeaseStats>,
}

impl PgConnectionSource {
    pub fn new(pool: PgPool, stats: Arc<LeaseStats>) -> Self {
        Self { pool, stats }
    }

    pub fn stats(&self) -> &Arc<LeaseStats> {
        &self.stats
    }
}

#[async_trait]
impl ConnectionSource for PgConnectionSource {
    type Connection = PgSessionConnection;

    async fn lease(&self, ctx: &QueryContext) -> ClientResult<PgSessionConnection> {
        let started = Instant::now();
        let result = ctx
            .run(async { self.pool.acquire().await.map_err(ClientError::from) })
            .await;

        match result {
            Ok(conn) => {
                let waited = started.elapsed();
                if self.stats.record_lease(waited) {
                    warn!(
                        waited_ms = waited.as_millis() as u64,
                        pool_size = self.pool.size(),
                        idle = self.pool.num_idle(),
                        "🐢 POOL: Slow connection lease"
                    );
                }
                Ok(PgSessionConnection::new(conn))
            }
            Err(err) if err.is_cancellation() => {
                self.stats.record_cancelled();
                debug!(error = %err, "Connection lease abandoned by caller");
                Err(err)
            }
            Err(err) => {
                self.stats.record_error();
                logging::log_error("pool", "lease", &err.to_string(), None);
                Err(err)
            }
        }
    }

    fn record_stale(&self) {
        self.stats.record_stale();
    }
}
