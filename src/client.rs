//! # Database Client
//!
//! Wires the pool manager, session broker, search path resolver, retry
//! controller and executor together against a real PostgreSQL server.
//!
//! ```rust,no_run
//! use plugsql_core::client::DbClient;
//! use plugsql_core::config::ClientConfig;
//! use plugsql_core::context::QueryContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DbClient::connect(ClientConfig::default()).await?;
//! let ctx = QueryContext::new();
//!
//! let mut rows = client.execute(&ctx, "select name from aws_s3_bucket", vec![]).await?;
//! while let Some(row) = rows.next_row().await {
//!     println!("{:?}", row?);
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::connection_state::{ConnectionStateMap, ConnectionStateStore};
use crate::context::QueryContext;
use crate::database::connection::{BackendId, PgConnectionSource, PgSessionConnection};
use crate::database::management::ManagementClient;
use crate::database::pools::{DatabasePools, PoolHooks, PoolSizeOverrides, PoolUtilization};
use crate::database::system_calls::{execute_system_call, SystemCall};
use crate::error::ClientResult;
use crate::logging;
use crate::query::executor::{CompletionCallback, ExecOptions, QueryExecutor};
use crate::query::result::StreamingResult;
use crate::query::types::{QueryArg, SyncQueryResult};
use crate::resilience::{RetryPolicy, SchemaRetryController};
use crate::search_path::SearchPathResolver;
use crate::session::{DatabaseSession, SessionBroker, SessionPolicy, SessionRegistry, SharedPolicy};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A session bound to a pooled server connection.
pub type PgSession = DatabaseSession<PgSessionConnection>;

pub struct DbClient {
    config: RwLock<ClientConfig>,
    pools: DatabasePools,
    management: ManagementClient,
    registry: Arc<SessionRegistry>,
    resolver: Arc<SearchPathResolver>,
    policy: SharedPolicy,
    retry: Arc<SchemaRetryController>,
    broker: SessionBroker<PgConnectionSource>,
    executor: QueryExecutor,
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("pools", &self.pools)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DbClient {
    /// Connect with the default pool sizing from `config`.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        Self::connect_with_overrides(config, PoolSizeOverrides::default()).await
    }

    pub async fn connect_with_overrides(
        config: ClientConfig,
        overrides: PoolSizeOverrides,
    ) -> ClientResult<Self> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new());

        let primed = Arc::clone(&registry);
        let evicted = Arc::clone(&registry);
        let hooks = PoolHooks {
            after_connect: Some(Arc::new(move |backend_id: BackendId| {
                primed.reset(backend_id);
            })),
            on_evict: Some(Arc::new(move |backend_id: BackendId| {
                evicted.evict(backend_id);
            })),
        };
        let pools = DatabasePools::establish(&config, overrides, hooks).await?;

        let management = ManagementClient::new(pools.management_pool().clone());
        let resolver = Arc::new(SearchPathResolver::new(Some(Arc::new(management.clone()))));
        resolver.configure(
            config.search_path.search_path.clone(),
            config.search_path.search_path_prefix.clone(),
        );

        let ctx = QueryContext::with_timeout(config.database.connect_timeout());
        if let Err(err) = resolver.refresh_user_search_path(&ctx).await {
            pools.close().await;
            return Err(err);
        }

        let mut policy = SessionPolicy::from_config(&config);
        if policy.timing_enabled {
            policy.diagnostics_baseline = diagnostics_baseline(&management, &ctx).await;
        }
        let policy = policy.shared();

        let retry = Arc::new(SchemaRetryController::new(
            Arc::new(management.clone()),
            Arc::clone(&resolver),
            RetryPolicy::from(&config.retry),
        ));
        let broker = SessionBroker::new(
            pools.connection_source(),
            Arc::clone(&registry),
            Arc::clone(&resolver),
            Arc::clone(&policy),
            pools.gate().clone(),
        );
        let executor = QueryExecutor::new(Arc::clone(&retry), Arc::clone(&policy));
        pools.spawn_session_reaper(Arc::clone(&registry), config.pool.reap_interval());

        info!(
            application_name = %pools.application_name(),
            search_path = ?resolver.required_search_path(),
            "✅ CLIENT: Connected"
        );

        Ok(Self {
            config: RwLock::new(config),
            pools,
            management,
            registry,
            resolver,
            policy,
            retry,
            broker,
            executor,
        })
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    pub fn session_registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Acquire a session with cache policy applied and the search path set.
    pub async fn acquire_session(&self, ctx: &QueryContext) -> ClientResult<PgSession> {
        self.broker.acquire(ctx).await
    }

    /// Run `sql` on a fresh session. The session goes back to the pool once
    /// the returned rows are drained or the result is dropped.
    pub async fn execute(
        &self,
        ctx: &QueryContext,
        sql: impl Into<String>,
        args: Vec<QueryArg>,
    ) -> ClientResult<StreamingResult> {
        let session = self.acquire_session(ctx).await?;
        self.executor
            .execute(ctx, session, sql, args, ExecOptions::default(), None)
            .await
    }

    /// Run `sql` on a session the caller already holds. The session is handed
    /// to `on_complete` once the rows are drained.
    pub async fn execute_in_session(
        &self,
        ctx: &QueryContext,
        session: PgSession,
        sql: impl Into<String>,
        args: Vec<QueryArg>,
        on_complete: Option<CompletionCallback<PgSessionConnection>>,
    ) -> ClientResult<StreamingResult> {
        self.executor
            .execute(ctx, session, sql, args, ExecOptions::default(), on_complete)
            .await
    }

    /// Run `sql` and collect every row.
    pub async fn execute_sync(
        &self,
        ctx: &QueryContext,
        sql: impl Into<String>,
        args: Vec<QueryArg>,
    ) -> ClientResult<SyncQueryResult> {
        self.execute(ctx, sql, args).await?.collect_rows().await
    }

    /// Apply a new configuration to the running client.
    ///
    /// Search path, cache, timing, query timeout and retry settings take
    /// effect on the next acquisition. Pool sizing and the database address
    /// need a new client.
    pub async fn reload_config(&self, ctx: &QueryContext, config: ClientConfig) -> ClientResult<()> {
        config.validate()?;
        {
            let current = self.config.read();
            if current.pool != config.pool
                || current.database != config.database
                || current.connection_mode != config.connection_mode
            {
                warn!("⚠️ CLIENT: Pool and database settings change only on reconnect");
            }
        }

        self.resolver.configure(
            config.search_path.search_path.clone(),
            config.search_path.search_path_prefix.clone(),
        );
        self.retry.set_policy(RetryPolicy::from(&config.retry));

        let enable_timing = {
            let mut policy = self.policy.write();
            let turns_on = policy.timing_turns_on(config.query.timing);
            policy.apply_config(&config);
            turns_on
        };
        if enable_timing {
            let baseline = diagnostics_baseline(&self.management, ctx).await;
            self.policy.write().diagnostics_baseline = baseline;
        }

        *self.config.write() = config;
        self.resolver.refresh_user_search_path(ctx).await?;
        info!(
            search_path = ?self.resolver.required_search_path(),
            "🔄 CLIENT: Configuration reloaded"
        );
        Ok(())
    }

    /// Re-read the user search path; sessions pick it up on next acquisition.
    pub async fn refresh_search_path(&self, ctx: &QueryContext) -> ClientResult<Vec<String>> {
        self.resolver.refresh_user_search_path(ctx).await?;
        Ok(self.resolver.required_search_path())
    }

    pub fn required_search_path(&self) -> Vec<String> {
        self.resolver.required_search_path()
    }

    /// Turn scan diagnostics on or off. Switching them on from off records the
    /// current newest diagnostic row so earlier scans are never reported;
    /// asking again while on keeps that baseline.
    pub async fn set_timing(&self, ctx: &QueryContext, enabled: bool) -> ClientResult<()> {
        let turns_on = self.policy.read().timing_turns_on(enabled);
        if turns_on {
            let baseline = self.management.max_scan_metadata_id(ctx).await?;
            let mut policy = self.policy.write();
            policy.timing_enabled = true;
            policy.diagnostics_baseline = baseline;
        } else {
            self.policy.write().timing_enabled = enabled;
        }
        self.config.write().query.timing = enabled;
        Ok(())
    }

    pub fn timing_enabled(&self) -> bool {
        self.policy.read().timing_enabled
    }

    /// Clear the server-side metadata cache.
    pub async fn cache_clear(&self, ctx: &QueryContext) -> ClientResult<()> {
        let mut session = self.acquire_session(ctx).await?;
        ctx.run(execute_system_call(session.connection_mut(), SystemCall::CacheClear))
            .await
    }

    /// Request server caching on or off for every subsequent acquisition.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.policy.write().cache_enabled = Some(enabled);
        self.config.write().cache.enabled = Some(enabled);
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.policy.write().cache_ttl = Some(ttl);
        self.config.write().cache.ttl_seconds = Some(ttl.as_secs());
    }

    pub async fn connection_states(&self, ctx: &QueryContext) -> ClientResult<ConnectionStateMap> {
        self.management.load_states(ctx).await
    }

    /// Distinct client processes connected to the server, this one included.
    pub async fn active_client_count(&self, ctx: &QueryContext) -> ClientResult<i64> {
        self.management.active_client_count(ctx).await
    }

    pub fn pool_utilization(&self) -> PoolUtilization {
        self.pools.utilization()
    }

    /// Wait for in-flight acquisitions, then close both pools.
    pub async fn close(&self) {
        self.pools.close().await;
    }
}

/// Newest diagnostic row id, or 0 when the diagnostics table cannot be read.
async fn diagnostics_baseline(management: &ManagementClient, ctx: &QueryContext) -> i64 {
    match management.max_scan_metadata_id(ctx).await {
        Ok(id) => id,
        Err(err) => {
            logging::log_error("client", "diagnostics_baseline", &err.to_string(), None);
            0
        }
    }
}
