//! # Connection State Catalog
//!
//! Read-only view of the table through which the plugin loader publishes
//! per-connection readiness. The schema retry controller uses it to decide
//! whether a missing relation is still loading or genuinely absent.

use crate::context::QueryContext;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Loader-published connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Pending,
    PendingIncomplete,
    Incomplete,
    Updating,
    Deleting,
    Ready,
    Disabled,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::PendingIncomplete => "pending-incomplete",
            ConnectionStatus::Incomplete => "incomplete",
            ConnectionStatus::Updating => "updating",
            ConnectionStatus::Deleting => "deleting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Disabled => "disabled",
            ConnectionStatus::Error => "error",
        }
    }

    /// Ready, disabled and error will not change without operator action.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Ready | ConnectionStatus::Disabled | ConnectionStatus::Error
        )
    }

    /// Lenient parse: unknown states are treated as still loading.
    pub fn from_catalog(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!(state = %value, "Unknown connection state, treating as pending");
            ConnectionStatus::Pending
        })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(ConnectionStatus::Pending),
            "pending-incomplete" => Ok(ConnectionStatus::PendingIncomplete),
            "incomplete" => Ok(ConnectionStatus::Incomplete),
            "updating" => Ok(ConnectionStatus::Updating),
            "deleting" => Ok(ConnectionStatus::Deleting),
            "ready" => Ok(ConnectionStatus::Ready),
            "disabled" => Ok(ConnectionStatus::Disabled),
            "error" => Ok(ConnectionStatus::Error),
            _ => Err(ClientError::DecodeError(format!(
                "unknown connection state '{s}'"
            ))),
        }
    }
}

/// One catalog row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStateEntry {
    pub name: String,
    pub state: ConnectionStatus,
    pub error: Option<String>,
    pub connection_mod_time: DateTime<Utc>,
    /// Plugin serving this connection, when the loader records it
    pub plugin: Option<String>,
}

impl ConnectionStateEntry {
    pub fn new(name: impl Into<String>, state: ConnectionStatus, connection_mod_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state,
            error: None,
            connection_mod_time,
            plugin: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Ready, and has been for strictly longer than `grace`.
    pub fn ready_for_longer_than(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        if self.state != ConnectionStatus::Ready {
            return false;
        }
        let Ok(grace) = chrono::Duration::from_std(grace) else {
            return false;
        };
        now.signed_duration_since(self.connection_mod_time) > grace
    }

    /// Will not start resolving without operator action: disabled, or ready
    /// for longer than `grace`.
    pub fn is_final(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        self.state == ConnectionStatus::Disabled || self.ready_for_longer_than(grace, now)
    }

    /// Error to surface for a connection in `error` state.
    pub fn to_error(&self) -> ClientError {
        ClientError::ConnectionStateError {
            connection: self.name.clone(),
            message: self
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    fn plugin_key(&self) -> &str {
        self.plugin.as_deref().unwrap_or(&self.name)
    }
}

/// Snapshot of the catalog keyed by connection name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStateMap {
    entries: HashMap<String, ConnectionStateEntry>,
}

impl ConnectionStateMap {
    pub fn from_entries(entries: impl IntoIterator<Item = ConnectionStateEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionStateEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionStateEntry> {
        self.entries.values()
    }

    /// For every plugin referenced in `search_path`, the first schema of that
    /// plugin in path order. These are what an unqualified name resolves
    /// against. Schemas not in the catalog are ignored.
    pub fn first_search_path_schemas(&self, search_path: &[String]) -> Vec<&ConnectionStateEntry> {
        let mut seen_plugins = HashSet::new();
        search_path
            .iter()
            .filter_map(|schema| self.entries.get(schema))
            .filter(|entry| seen_plugins.insert(entry.plugin_key().to_string()))
            .collect()
    }
}

/// Reads the catalog.
#[async_trait]
pub trait ConnectionStateStore: Send + Sync {
    async fn load_states(&self, ctx: &QueryContext) -> ClientResult<ConnectionStateMap>;

    /// Poll until every first-per-plugin schema of `search_path` is settled.
    ///
    /// A schema in `error` state fails the wait with its stored message;
    /// running out of `timeout` fails with [`ClientError::Timeout`].
    async fn wait_for_search_path(
        &self,
        ctx: &QueryContext,
        search_path: &[String],
        timeout: Duration,
        poll_interval: Duration,
    ) -> ClientResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let states = self.load_states(ctx).await?;
            let first_schemas = states.first_search_path_schemas(search_path);

            if let Some(failed) = first_schemas
                .iter()
                .find(|entry| entry.state == ConnectionStatus::Error)
            {
                return Err(failed.to_error());
            }

            let pending: Vec<&str> = first_schemas
                .iter()
                .filter(|entry| !entry.state.is_settled())
                .map(|entry| entry.name.as_str())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            if Instant::now() + poll_interval > deadline {
                return Err(ClientError::Timeout(format!(
                    "connections still loading after {}ms: {}",
                    timeout.as_millis(),
                    pending.join(", ")
                )));
            }
            debug!(pending = ?pending, "Waiting for search path connections");
            ctx.sleep(poll_interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeStateStore;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn entry(name: &str, state: ConnectionStatus) -> ConnectionStateEntry {
        ConnectionStateEntry::new(name, state, Utc::now())
    }

    #[test]
    fn test_status_parsing_accepts_both_separators() {
        assert_eq!(
            "pending_incomplete".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::PendingIncomplete
        );
        assert_eq!(
            "pending-incomplete".parse::<ConnectionStatus>().unwrap(),
            ConnectionStatus::PendingIncomplete
        );
        assert_eq!(ConnectionStatus::from_catalog("warming"), ConnectionStatus::Pending);
    }

    #[test]
    fn test_ready_grace_period() {
        let now = Utc::now();
        let fresh = ConnectionStateEntry::new("aws", ConnectionStatus::Ready, now);
        let stale = ConnectionStateEntry::new(
            "aws",
            ConnectionStatus::Ready,
            now - chrono::Duration::seconds(5),
        );
        let disabled = ConnectionStateEntry::new(
            "aws",
            ConnectionStatus::Disabled,
            now - chrono::Duration::seconds(5),
        );

        let grace = Duration::from_millis(250);
        assert!(!fresh.ready_for_longer_than(grace, now));
        assert!(stale.ready_for_longer_than(grace, now));
        assert!(!disabled.ready_for_longer_than(grace, now));

        assert!(!fresh.is_final(grace, now));
        assert!(stale.is_final(grace, now));
        assert!(disabled.is_final(grace, now));
        assert!(!ConnectionStateEntry::new("aws", ConnectionStatus::Updating, now - chrono::Duration::minutes(5))
            .is_final(grace, now));
    }

    #[test]
    fn test_first_schema_per_plugin() {
        let states = ConnectionStateMap::from_entries(vec![
            entry("aws_dev", ConnectionStatus::Ready).with_plugin("aws"),
            entry("aws_prod", ConnectionStatus::Pending).with_plugin("aws"),
            entry("gcp", ConnectionStatus::Pending).with_plugin("gcp"),
        ]);

        let firsts = states.first_search_path_schemas(&strings(&[
            "public", "aws_dev", "aws_prod", "gcp",
        ]));
        let names: Vec<&str> = firsts.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["aws_dev", "gcp"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_ready() {
        let store = FakeStateStore::new(ConnectionStateMap::from_entries(vec![entry(
            "aws",
            ConnectionStatus::PendingIncomplete,
        )]));
        store.push(ConnectionStateMap::from_entries(vec![entry(
            "aws",
            ConnectionStatus::Ready,
        )]));

        store
            .wait_for_search_path(
                &QueryContext::new(),
                &strings(&["aws"]),
                Duration::from_secs(10),
                Duration::from_millis(250),
            )
            .await
            .unwrap();
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_surfaces_error_state() {
        let store = FakeStateStore::new(ConnectionStateMap::from_entries(vec![entry(
            "aws",
            ConnectionStatus::Error,
        )
        .with_error("bad credentials")]));

        let err = store
            .wait_for_search_path(
                &QueryContext::new(),
                &strings(&["aws"]),
                Duration::from_secs(10),
                Duration::from_millis(250),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let store = FakeStateStore::new(ConnectionStateMap::from_entries(vec![entry(
            "aws",
            ConnectionStatus::Updating,
        )]));

        let err = store
            .wait_for_search_path(
                &QueryContext::new(),
                &strings(&["aws"]),
                Duration::from_secs(1),
                Duration::from_millis(250),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }
}
