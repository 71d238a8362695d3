//! # Connection Pool Manager
//!
//! Owns the two pools a client talks through: an elastic user pool sized by
//! `pool.max_parallel` for queries, and a small management pool for catalog
//! reads and other bookkeeping so it never queues behind user load.
//!
//! Every connection carries an application name unique to this client
//! process. Connections past their max lifetime are closed when they come
//! back to the pool, and the eviction hook fires so the session map forgets
//! them; a periodic reaper reconciles the map against `pg_stat_activity` for
//! connections closed any other way.

use crate::config::{ClientConfig, ConnectionMode, PoolConfig};
use crate::constants::{application_names, defaults};
use crate::database::connection::{BackendId, PgConnectionSource};
use crate::database::management;
use crate::database::pool_stats::{LeaseStats, LeaseStatsSnapshot};
use crate::error::{ClientError, ClientResult};
use crate::logging;
use crate::session::{LifecycleGate, SessionRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions};
use sqlx::{Connection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Called with the backend id of a physical connection.
pub type BackendHook = Arc<dyn Fn(BackendId) + Send + Sync + 'static>;

/// Callbacks run by the user pool.
#[derive(Clone, Default)]
pub struct PoolHooks {
    /// Once per new physical connection
    pub after_connect: Option<BackendHook>,
    /// Whenever the pool closes a connection past its max lifetime
    pub on_evict: Option<BackendHook>,
}

impl std::fmt::Debug for PoolHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHooks")
            .field("after_connect", &self.after_connect.is_some())
            .field("on_evict", &self.on_evict.is_some())
            .finish()
    }
}

/// Size overrides applied on top of [`PoolConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSizeOverrides {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
}

/// Resolved user-pool sizing. The minimum never exceeds the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub max_connections: u32,
    pub min_connections: u32,
}

impl PoolSizing {
    pub fn resolve(config: &PoolConfig, mode: ConnectionMode, overrides: PoolSizeOverrides) -> Self {
        if mode == ConnectionMode::Single {
            return Self {
                max_connections: 1,
                min_connections: 1,
            };
        }
        let max_connections = overrides
            .max_connections
            .unwrap_or(config.max_parallel)
            .max(1);
        let min_connections = overrides
            .min_connections
            .unwrap_or(config.min_connections)
            .min(max_connections);
        Self {
            max_connections,
            min_connections,
        }
    }
}

/// Point-in-time view of the user pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolUtilization {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
    pub max_connections: u32,
    pub is_closed: bool,
    pub leases: LeaseStatsSnapshot,
}

impl PoolUtilization {
    pub fn utilization_percentage(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.in_use as f64 / self.max_connections as f64) * 100.0
        }
    }

    pub fn is_under_stress(&self) -> bool {
        self.utilization_percentage() > 80.0
    }
}

pub struct DatabasePools {
    user: PgPool,
    management: PgPool,
    application_name: String,
    sizing: PoolSizing,
    mode: ConnectionMode,
    stats: Arc<LeaseStats>,
    gate: LifecycleGate,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for DatabasePools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePools")
            .field("application_name", &self.application_name)
            .field("sizing", &self.sizing)
            .field("mode", &self.mode)
            .finish()
    }
}

impl DatabasePools {
    /// Build both pools and wait until the server answers a ping.
    pub async fn establish(
        config: &ClientConfig,
        overrides: PoolSizeOverrides,
        hooks: PoolHooks,
    ) -> ClientResult<Self> {
        let application_name = format!(
            "{}_{}",
            application_names::CLIENT_PREFIX,
            Uuid::new_v4().simple()
        );
        let connect_options = PgConnectOptions::from_str(&config.database_url())
            .map_err(|e| ClientError::ConfigurationError(format!("invalid database url: {e}")))?;

        let mode = config.connection_mode;
        let sizing = PoolSizing::resolve(&config.pool, mode, overrides);
        let stats = Arc::new(LeaseStats::new(
            "user",
            sizing.max_connections,
            Duration::from_millis(u64::from(config.pool.slow_acquire_threshold_ms)),
        ));

        let hooks = PoolHooks {
            after_connect: hooks.after_connect,
            on_evict: Some(counted_eviction_hook(Arc::clone(&stats), hooks.on_evict)),
        };
        let user_connect_options = connect_options.clone().application_name(&application_name);
        let user = user_pool_options(&config.pool, mode, sizing, hooks)
            .connect_lazy_with(user_connect_options.clone());

        let management_name = format!("{application_name}_{}", application_names::MANAGEMENT_SUFFIX);
        let management = PgPoolOptions::new()
            .max_connections(config.pool.management_max_connections.max(1))
            .min_connections(0)
            .acquire_timeout(config.pool.acquire_timeout())
            .idle_timeout(Some(config.pool.max_idle()))
            .max_lifetime(Some(config.pool.max_lifetime()))
            .connect_lazy_with(connect_options.application_name(&management_name));

        info!(
            application_name = %application_name,
            max_connections = sizing.max_connections,
            min_connections = sizing.min_connections,
            mode = ?mode,
            "🔌 POOL: Initializing database pools"
        );

        if let Err(err) =
            wait_for_ping(&user_connect_options, config.database.connect_timeout()).await
        {
            user.close().await;
            management.close().await;
            return Err(err);
        }

        info!(
            application_name = %application_name,
            size = user.size(),
            "✅ POOL: Database reachable"
        );

        Ok(Self {
            user,
            management,
            application_name,
            sizing,
            mode,
            stats,
            gate: LifecycleGate::new(),
            reaper: Mutex::new(None),
        })
    }

    pub fn user_pool(&self) -> &PgPool {
        &self.user
    }

    pub fn management_pool(&self) -> &PgPool {
        &self.management
    }

    /// Connection source for the session broker, sharing this pool's stats.
    pub fn connection_source(&self) -> PgConnectionSource {
        PgConnectionSource::new(self.user.clone(), Arc::clone(&self.stats))
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn sizing(&self) -> PoolSizing {
        self.sizing
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<LeaseStats> {
        &self.stats
    }

    pub fn utilization(&self) -> PoolUtilization {
        let size = self.user.size();
        let idle = self.user.num_idle() as u32;
        PoolUtilization {
            size,
            idle,
            in_use: size.saturating_sub(idle),
            max_connections: self.sizing.max_connections,
            is_closed: self.user.is_closed(),
            leases: self.stats.snapshot(),
        }
    }

    /// Periodically drop session entries whose backend is no longer one of
    /// this client's connections. Replaces any reaper already running.
    pub fn spawn_session_reaper(&self, registry: Arc<SessionRegistry>, interval: Duration) {
        let token = CancellationToken::new();
        let management = self.management.clone();
        let application_name = self.application_name.clone();
        let stats = Arc::clone(&self.stats);
        let shutdown = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match management::live_backend_ids(&management, &application_name).await {
                    Ok(live) => {
                        let removed = registry.retain_live(&live);
                        for _ in 0..removed {
                            stats.record_eviction();
                        }
                        if removed > 0 {
                            debug!(
                                removed = removed,
                                remaining = registry.len(),
                                "🧹 POOL: Reaped closed sessions"
                            );
                        }
                    }
                    Err(err) => {
                        logging::log_error("pool", "session_reaper", &err.to_string(), None);
                    }
                }
            }
        });

        if let Some((previous, handle)) = self.reaper.lock().replace((token, handle)) {
            previous.cancel();
            handle.abort();
        }
    }

    /// Wait for in-flight session initialisation, then close both pools.
    pub async fn close(&self) {
        self.gate.close().await;
        if let Some((token, handle)) = self.reaper.lock().take() {
            token.cancel();
            handle.abort();
        }
        self.user.close().await;
        self.management.close().await;
        info!(application_name = %self.application_name, "🔌 POOL: Database pools closed");
    }
}

fn user_pool_options(
    config: &PoolConfig,
    mode: ConnectionMode,
    sizing: PoolSizing,
    hooks: PoolHooks,
) -> PgPoolOptions {
    let mut options = PgPoolOptions::new()
        .max_connections(sizing.max_connections)
        .min_connections(sizing.min_connections)
        .acquire_timeout(config.acquire_timeout())
        // Lifetime is enforced on release so the eviction hook sees the close.
        .max_lifetime(None);

    options = match mode {
        ConnectionMode::Single => options.idle_timeout(None),
        ConnectionMode::Pooled => options.idle_timeout(Some(config.max_idle())),
    };

    if let Some(after_connect) = hooks.after_connect {
        options = options.after_connect(move |conn, _meta| {
            let after_connect = Arc::clone(&after_connect);
            Box::pin(async move {
                let backend_id: BackendId = sqlx::query_scalar("SELECT pg_backend_pid()")
                    .fetch_one(&mut *conn)
                    .await?;
                after_connect(backend_id);
                Ok(())
            })
        });
    }

    if mode == ConnectionMode::Pooled {
        let max_lifetime = config.max_lifetime();
        let on_evict = hooks.on_evict;
        options = options.after_release(move |conn, meta| {
            let on_evict = on_evict.clone();
            Box::pin(async move {
                if meta.age < max_lifetime {
                    return Ok(true);
                }
                let backend_id: Option<BackendId> = sqlx::query_scalar("SELECT pg_backend_pid()")
                    .fetch_one(&mut *conn)
                    .await
                    .ok();
                Ok(keep_released(meta.age, max_lifetime, backend_id, on_evict.as_ref()))
            })
        });
    }

    options
}

/// Eviction hook that counts the eviction before handing the backend id on.
fn counted_eviction_hook(stats: Arc<LeaseStats>, next: Option<BackendHook>) -> BackendHook {
    Arc::new(move |backend_id: BackendId| {
        stats.record_eviction();
        if let Some(hook) = &next {
            hook(backend_id);
        }
    })
}

/// Whether a released connection goes back to the pool. One past
/// `max_lifetime` is closed and reported to `on_evict`.
fn keep_released(
    age: Duration,
    max_lifetime: Duration,
    backend_id: Option<BackendId>,
    on_evict: Option<&BackendHook>,
) -> bool {
    if age < max_lifetime {
        return true;
    }
    debug!(
        backend_id = backend_id,
        age_secs = age.as_secs(),
        "Closing connection past max lifetime"
    );
    if let (Some(hook), Some(backend_id)) = (on_evict, backend_id) {
        hook(backend_id);
    }
    false
}

/// Ping until the server answers or `timeout` elapses.
///
/// Pings on a dedicated connection rather than through a pool, which would
/// retry refused sockets itself and report only a pool timeout.
/// Authentication and other server-side errors fail at once. A socket that
/// keeps refusing surfaces as [`ClientError::ConnectionRefused`]; anything
/// else surfaces as [`ClientError::ConnectTimeout`].
pub async fn wait_for_ping(options: &PgConnectOptions, timeout: Duration) -> ClientResult<()> {
    let deadline = Instant::now() + timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let last = match tokio::time::timeout(remaining, ping_once(options)).await {
            Ok(Ok(())) => {
                debug!(attempt = attempt, "Database ping succeeded");
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => ClientError::ConnectTimeout(format!(
                "no answer within {}ms",
                timeout.as_millis()
            )),
        };

        if matches!(last, ClientError::DatabaseError { .. } | ClientError::ConfigurationError(_)) {
            return Err(last);
        }

        if Instant::now() + defaults::PING_RETRY_INTERVAL >= deadline {
            return Err(match last {
                ClientError::ConnectionRefused(message) => ClientError::ConnectionRefused(message),
                ClientError::ConnectTimeout(message) => ClientError::ConnectTimeout(message),
                other => ClientError::ConnectTimeout(other.to_string()),
            });
        }

        if attempt == 1 {
            warn!(error = %last, "⏳ POOL: Database not reachable yet, retrying");
        }
        tokio::time::sleep(defaults::PING_RETRY_INTERVAL).await;
    }
}

async fn ping_once(options: &PgConnectOptions) -> ClientResult<()> {
    let mut conn = PgConnection::connect_with(options).await?;
    let pinged = conn.ping().await;
    if let Err(err) = conn.close().await {
        debug!(error = %err, "Ping connection did not close cleanly");
    }
    Ok(pinged?)
}
