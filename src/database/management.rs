//! # Management Queries
//!
//! Bookkeeping that runs on the management pool: connection-state catalog
//! reads, the login role's search path, this client's live backends and the
//! number of clients connected.

use crate::connection_state::{
    ConnectionStateEntry, ConnectionStateMap, ConnectionStateStore, ConnectionStatus,
};
use crate::constants::{application_names, CONNECTION_STATE_TABLE, INTERNAL_SCHEMA};
use crate::context::QueryContext;
use crate::database::connection::BackendId;
use crate::error::{ClientError, ClientResult};
use crate::query::diagnostics::max_scan_metadata_id_query;
use crate::search_path::{parse_search_path, UserSearchPathSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use tracing::debug;

/// Catalog read, one row per connection.
pub fn connection_state_query() -> String {
    format!(
        "SELECT name, state, error, connection_mod_time, plugin \
         FROM {INTERNAL_SCHEMA}.{CONNECTION_STATE_TABLE}"
    )
}

/// Search path from a role's `rolconfig` entries (`search_path=a, b`).
pub fn search_path_from_role_config(rolconfig: &[String]) -> Option<Vec<String>> {
    rolconfig
        .iter()
        .find_map(|entry| entry.strip_prefix("search_path="))
        .map(parse_search_path)
}

/// Strip the management suffix so both pools of one client count once.
pub fn client_application_name(application_name: &str) -> &str {
    application_name
        .strip_suffix(application_names::MANAGEMENT_SUFFIX)
        .and_then(|name| name.strip_suffix('_'))
        .unwrap_or(application_name)
}

pub async fn load_connection_states(pool: &PgPool) -> ClientResult<ConnectionStateMap> {
    let rows = sqlx::query(&connection_state_query()).fetch_all(pool).await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let state: String = row.try_get("state")?;
        let error: Option<String> = row.try_get("error")?;
        let connection_mod_time: Option<DateTime<Utc>> = row.try_get("connection_mod_time")?;
        let plugin: Option<String> = row.try_get("plugin")?;

        let mut entry = ConnectionStateEntry::new(
            name,
            ConnectionStatus::from_catalog(&state),
            connection_mod_time.unwrap_or(DateTime::<Utc>::MIN_UTC),
        );
        if let Some(error) = error.filter(|e| !e.is_empty()) {
            entry = entry.with_error(error);
        }
        if let Some(plugin) = plugin {
            entry = entry.with_plugin(plugin);
        }
        entries.push(entry);
    }

    debug!(connections = entries.len(), "Connection state catalog loaded");
    Ok(ConnectionStateMap::from_entries(entries))
}

/// The login role's search path, falling back to the effective setting when
/// the role has none of its own.
pub async fn load_user_search_path(pool: &PgPool) -> ClientResult<Vec<String>> {
    let rolconfig = sqlx::query_scalar::<_, Option<Vec<String>>>(
        "SELECT rolconfig FROM pg_roles WHERE rolname = current_user",
    )
    .fetch_optional(pool)
    .await?
    .flatten();

    if let Some(search_path) = rolconfig.as_deref().and_then(search_path_from_role_config) {
        return Ok(search_path);
    }

    let setting: String = sqlx::query_scalar("SELECT current_setting('search_path')")
        .fetch_one(pool)
        .await?;
    Ok(parse_search_path(&setting))
}

/// Backend ids currently held by this client, including connections briefly
/// re-tagged for a system call.
pub async fn live_backend_ids(
    pool: &PgPool,
    application_name: &str,
) -> ClientResult<HashSet<BackendId>> {
    let names = vec![application_name.to_string(), application_names::SYSTEM.to_string()];
    let pids: Vec<BackendId> =
        sqlx::query_scalar("SELECT pid FROM pg_stat_activity WHERE application_name = ANY($1)")
            .bind(names)
            .fetch_all(pool)
            .await?;
    Ok(pids.into_iter().collect())
}

/// Distinct client processes connected to the server.
pub async fn active_client_count(pool: &PgPool) -> ClientResult<i64> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT application_name FROM pg_stat_activity WHERE application_name LIKE $1",
    )
    .bind(format!("{}\\_%", application_names::CLIENT_PREFIX))
    .fetch_all(pool)
    .await?;

    let clients: HashSet<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| *name != application_names::SYSTEM)
        .map(client_application_name)
        .collect();
    Ok(clients.len() as i64)
}

pub async fn max_scan_metadata_id(pool: &PgPool) -> ClientResult<i64> {
    let id: i64 = sqlx::query_scalar(&max_scan_metadata_id_query())
        .fetch_one(pool)
        .await?;
    Ok(id)
}

/// Management-pool handle implementing the catalog and search path seams.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    pool: PgPool,
}

impl ManagementClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn live_backend_ids(
        &self,
        ctx: &QueryContext,
        application_name: &str,
    ) -> ClientResult<HashSet<BackendId>> {
        ctx.run(live_backend_ids(&self.pool, application_name)).await
    }

    pub async fn active_client_count(&self, ctx: &QueryContext) -> ClientResult<i64> {
        ctx.run(active_client_count(&self.pool)).await
    }

    pub async fn max_scan_metadata_id(&self, ctx: &QueryContext) -> ClientResult<i64> {
        ctx.run(max_scan_metadata_id(&self.pool)).await
    }
}

#[async_trait]
impl ConnectionStateStore for ManagementClient {
    async fn load_states(&self, ctx: &QueryContext) -> ClientResult<ConnectionStateMap> {
        ctx.run(load_connection_states(&self.pool))
            .await
            .map_err(|err| match err {
                ClientError::DatabaseError { code, message } => ClientError::DatabaseError {
                    code,
                    message: format!("loading connection state: {message}"),
                },
                other => other,
            })
    }
}

#[async_trait]
impl UserSearchPathSource for ManagementClient {
    async fn load_user_search_path(&self, ctx: &QueryContext) -> ClientResult<Vec<String>> {
        ctx.run(load_user_search_path(&self.pool)).await
    }
}
