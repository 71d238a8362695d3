//! # Database Layer
//!
//! Pools, the connection seams the session broker works against, and the
//! queries that run outside user sessions.
//!
//! ## Key Components
//!
//! - [`pools`] - user and management pools, eviction hooks, session reaper
//! - [`connection`] - `SessionConnection` / `ConnectionSource` traits and their sqlx implementations
//! - [`management`] - catalog reads and other bookkeeping on the management pool
//! - [`system_calls`] - cache control functions exposed by the plugin loader
//! - [`error_codes`] - SQLSTATE classification

pub mod connection;
pub mod error_codes;
pub mod management;
pub mod pool_stats;
pub mod pools;
pub mod system_calls;

pub use connection::{
    BackendId, ConnectionSource, PgConnectionSource, PgSessionConnection, SessionConnection,
};
pub use management::ManagementClient;
pub use pool_stats::{LeaseStats, LeaseStatsSnapshot};
pub use pools::{DatabasePools, PoolHooks, PoolSizeOverrides, PoolUtilization};
pub use system_calls::SystemCall;
