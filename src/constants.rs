//! # System Constants
//!
//! Names shared with the plugin-loading subsystem and the defaults that bound
//! pool sizing and schema retry behavior.

use std::time::Duration;

/// Schema owned by the plugin loader. Holds the connection-state catalog,
/// the scan diagnostics table and the system functions.
pub const INTERNAL_SCHEMA: &str = "plugsql_internal";

/// Catalog table the loader uses to publish per-connection readiness.
pub const CONNECTION_STATE_TABLE: &str = "plugsql_connection_state";

/// Per-scan diagnostics table, keyed by an increasing id.
pub const SCAN_METADATA_TABLE: &str = "plugsql_scan_metadata";

/// Application-name tags used to tell this client's connections apart.
pub mod application_names {
    /// Prefix of every client's application name. Each process appends a
    /// unique suffix.
    pub const CLIENT_PREFIX: &str = "plugsql_client";

    /// Tag swapped in for the duration of a system-function transaction so the
    /// loader can tell system calls from user queries.
    pub const SYSTEM: &str = "plugsql_client_system";

    /// Tag for the management pool.
    pub const MANAGEMENT_SUFFIX: &str = "mgmt";
}

/// System functions exposed by the loader in [`INTERNAL_SCHEMA`](super::INTERNAL_SCHEMA).
pub mod system_functions {
    pub const META_CACHE: &str = "meta_cache";
    pub const META_CACHE_TTL: &str = "meta_cache_ttl";

    pub const CACHE_ON: &str = "on";
    pub const CACHE_OFF: &str = "off";
    pub const CACHE_CLEAR: &str = "clear";
}

/// Default values applied when configuration leaves a field unset.
pub mod defaults {
    use super::Duration;

    pub const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(10 * 60);
    pub const MAX_CONNECTION_IDLE: Duration = Duration::from_secs(60);
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const PING_RETRY_INTERVAL: Duration = Duration::from_millis(250);

    pub const MAX_PARALLEL: u32 = 10;
    pub const MIN_CONNECTIONS: u32 = 0;
    pub const MANAGEMENT_MAX_CONNECTIONS: u32 = 2;
    pub const SLOW_ACQUIRE_THRESHOLD_MS: u32 = 100;

    /// Interval between schema retry attempts; also the grace period after a
    /// connection flips to ready.
    pub const SCHEMA_RETRY_INTERVAL: Duration = Duration::from_millis(250);
    pub const SCHEMA_RETRY_MAX_DURATION: Duration = Duration::from_secs(5 * 60);
    pub const SEARCH_PATH_WAIT: Duration = Duration::from_secs(10);

    /// Attempts made to lease a live connection when pooled handles turn out
    /// to be dead.
    pub const STALE_CONNECTION_ATTEMPTS: u32 = 5;
    pub const STALE_CONNECTION_BACKOFF: Duration = Duration::from_millis(100);
}
