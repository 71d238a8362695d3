//! # Resilience Module
//!
//! Rides out the window in which a query references a schema the plugin
//! loader has not finished creating.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use plugsql_core::connection_state::ConnectionStateStore;
//! use plugsql_core::resilience::{RetryPolicy, SchemaRetryController};
//! use plugsql_core::search_path::SearchPathResolver;
//! use std::sync::Arc;
//!
//! # fn example(store: Arc<dyn ConnectionStateStore>) {
//! let resolver = Arc::new(SearchPathResolver::new(None));
//! let controller = SchemaRetryController::new(store, resolver, RetryPolicy::default());
//! assert_eq!(controller.policy().interval.as_millis(), 250);
//! # }
//! ```

pub mod schema_retry;

pub use schema_retry::{RetryDecision, RetryPolicy, SchemaRetryController};
