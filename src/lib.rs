#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # PlugSQL Core
//!
//! Client-side session broker and schema-consistency retry layer for
//! PostgreSQL servers whose schemas are created asynchronously by plugin
//! workers.
//!
//! ## Overview
//!
//! A query against a plugin schema can arrive before the loader has finished
//! creating it. This crate leases connections, keeps each physical
//! connection's search path in step with what the client requires, and when
//! a query fails because a relation does not exist, consults the loader's
//! connection-state catalog to decide whether to wait and retry or to surface
//! the error.
//!
//! ## Module Organization
//!
//! - [`client`] - `DbClient`, the entry point wiring every component together
//! - [`database`] - user and management pools, connection seams, management queries
//! - [`session`] - sessions, the session map and the session broker
//! - [`search_path`] - required search path computation
//! - [`connection_state`] - the loader's connection-state catalog
//! - [`resilience`] - schema retry controller
//! - [`query`] - executor, streaming results, type conversion and diagnostics
//! - [`config`] - configuration management
//! - [`error`] - structured error handling
//!
//! ## Data Flow
//!
//! caller → session broker → query executor → schema retry controller (start
//! only) → rows streamed back → session released to the pool.
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests against in-memory fakes
//! DATABASE_URL=postgres://... cargo test   # Adds the live database tests
//! ```

pub mod client;
pub mod config;
pub mod connection_state;
pub mod constants;
pub mod context;
pub mod database;
pub mod error;
pub mod logging;
pub mod query;
pub mod resilience;
pub mod search_path;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use client::{DbClient, PgSession};
pub use config::{ClientConfig, ConfigManager, ConnectionMode};
pub use connection_state::{ConnectionStateEntry, ConnectionStateMap, ConnectionStatus};
pub use context::QueryContext;
pub use error::{ClientError, ClientResult};
pub use query::{ColumnMeta, QueryArg, QueryDiagnostics, StreamingResult, SyncQueryResult, Value};
pub use search_path::SearchPathResolver;
pub use session::{DatabaseSession, SessionInfo};
