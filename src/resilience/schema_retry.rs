//! # Schema Retry Controller
//!
//! Wraps the start of a query. A "relation does not exist" failure is checked
//! against the connection-state catalog and either retried, because the
//! schema is plausibly still loading, or surfaced, because it never will be.
//!
//! | Missing schema | Catalog says | Decision |
//! |---|---|---|
//! | qualified | absent | surface original |
//! | qualified | `disabled` | surface original |
//! | qualified | `ready` longer than the interval | surface original |
//! | qualified | `error` | surface the stored connection error |
//! | qualified | anything else | retry |
//! | unqualified | any first schema per plugin in `error` | surface the stored connection error |
//! | unqualified | every first schema per plugin `disabled` or ready longer than the interval | surface original |
//! | unqualified | otherwise | wait for the search path, then retry |
//!
//! An unreadable or empty catalog surfaces the original error. The loop is
//! bounded by [`RetryPolicy::max_duration`]; running out returns the last error.

use crate::config::RetryConfig;
use crate::connection_state::{ConnectionStateMap, ConnectionStateStore, ConnectionStatus};
use crate::constants::defaults;
use crate::context::QueryContext;
use crate::database::connection::SessionConnection;
use crate::error::{ClientError, ClientResult};
use crate::logging;
use crate::query::types::ColumnMeta;
use crate::search_path::SearchPathResolver;
use crate::session::{ensure_session_search_path, DatabaseSession};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Constant backoff between attempts, also the readiness grace period
    pub interval: Duration,
    pub max_duration: Duration,
    /// Bound on a single wait-for-search-path round
    pub search_path_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: defaults::SCHEMA_RETRY_INTERVAL,
            max_duration: defaults::SCHEMA_RETRY_MAX_DURATION,
            search_path_wait: defaults::SEARCH_PATH_WAIT,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            interval: config.interval(),
            max_duration: config.max_duration(),
            search_path_wait: config.search_path_wait(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry,
    Surface(ClientError),
}

pub struct SchemaRetryController {
    states: Arc<dyn ConnectionStateStore>,
    resolver: Arc<SearchPathResolver>,
    policy: parking_lot::RwLock<RetryPolicy>,
}

impl SchemaRetryController {
    pub fn new(
        states: Arc<dyn ConnectionStateStore>,
        resolver: Arc<SearchPathResolver>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            states,
            resolver,
            policy: parking_lot::RwLock::new(policy),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write() = policy;
    }

    /// Prepare `sql` on the session, retrying missing relations while the
    /// catalog says they may still appear.
    pub async fn start_with_retry<C: SessionConnection>(
        &self,
        ctx: &QueryContext,
        session: &mut DatabaseSession<C>,
        sql: &str,
    ) -> ClientResult<Vec<ColumnMeta>> {
        let policy = self.policy();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match ctx.run(session.connection_mut().prepare(sql)).await {
                Ok(columns) => {
                    if attempt > 1 {
                        logging::log_retry_operation(
                            "start_query",
                            attempt,
                            None,
                            "succeeded",
                            Some(&format!("after {}ms", started.elapsed().as_millis())),
                        );
                    }
                    return Ok(columns);
                }
                Err(err) => err,
            };

            if !err.is_relation_not_found() {
                return Err(err);
            }

            let schema = err.missing_relation_schema();
            match self.evaluate(ctx, session, &err, &policy).await {
                RetryDecision::Surface(surfaced) => {
                    debug!(
                        attempt = attempt,
                        schema = schema.as_deref(),
                        error = %surfaced,
                        "Surfacing missing relation"
                    );
                    return Err(surfaced);
                }
                RetryDecision::Retry => {}
            }

            if started.elapsed() + policy.interval > policy.max_duration {
                warn!(
                    attempt = attempt,
                    schema = schema.as_deref(),
                    max_duration_ms = policy.max_duration.as_millis() as u64,
                    "🔁 RETRY: Gave up waiting for schema"
                );
                return Err(err);
            }

            logging::log_retry_operation(
                "start_query",
                attempt,
                schema.as_deref(),
                "retrying",
                Some(&err.to_string()),
            );
            ctx.sleep(policy.interval).await?;
        }
    }

    /// Decide what to do about one "relation does not exist" error.
    pub async fn evaluate<C: SessionConnection>(
        &self,
        ctx: &QueryContext,
        session: &mut DatabaseSession<C>,
        original: &ClientError,
        policy: &RetryPolicy,
    ) -> RetryDecision {
        let states = match self.states.load_states(ctx).await {
            Ok(states) if states.is_empty() => {
                return RetryDecision::Surface(original.clone());
            }
            Ok(states) => states,
            Err(err) if err.is_cancellation() => return RetryDecision::Surface(err),
            Err(err) => {
                warn!(error = %err, "Connection state catalog unavailable");
                return RetryDecision::Surface(original.clone());
            }
        };

        match original.missing_relation_schema() {
            Some(schema) => {
                let Some(entry) = states.get(&schema) else {
                    return RetryDecision::Surface(original.clone());
                };
                match entry.state {
                    ConnectionStatus::Disabled => RetryDecision::Surface(original.clone()),
                    ConnectionStatus::Error => RetryDecision::Surface(entry.to_error()),
                    ConnectionStatus::Ready
                        if entry.ready_for_longer_than(policy.interval, Utc::now()) =>
                    {
                        RetryDecision::Surface(original.clone())
                    }
                    _ => RetryDecision::Retry,
                }
            }
            None => self.evaluate_unqualified(ctx, session, original, policy, &states).await,
        }
    }

    async fn evaluate_unqualified<C: SessionConnection>(
        &self,
        ctx: &QueryContext,
        session: &mut DatabaseSession<C>,
        original: &ClientError,
        policy: &RetryPolicy,
        states: &ConnectionStateMap,
    ) -> RetryDecision {
        // Connections may have been added to the user search path while loading.
        if let Err(err) = self.resolver.refresh_user_search_path(ctx).await {
            if err.is_cancellation() {
                return RetryDecision::Surface(err);
            }
            warn!(error = %err, "Could not refresh user search path");
        }
        if let Err(err) = ensure_session_search_path(ctx, session, &self.resolver).await {
            return RetryDecision::Surface(err);
        }

        let search_path = session.search_path();
        let now = Utc::now();
        let first_schemas = states.first_search_path_schemas(&search_path);
        if let Some(failed) = first_schemas
            .iter()
            .find(|entry| entry.state == ConnectionStatus::Error)
        {
            return RetryDecision::Surface(failed.to_error());
        }
        if first_schemas
            .iter()
            .all(|entry| entry.is_final(policy.interval, now))
        {
            return RetryDecision::Surface(original.clone());
        }

        match self
            .states
            .wait_for_search_path(ctx, &search_path, policy.search_path_wait, policy.interval)
            .await
        {
            Ok(()) => RetryDecision::Retry,
            Err(err @ ClientError::ConnectionStateError { .. }) => RetryDecision::Surface(err),
            Err(err) if err.is_cancellation() => RetryDecision::Surface(err),
            Err(err) => {
                debug!(error = %err, "Search path wait ended without settling");
                RetryDecision::Retry
            }
        }
    }
}
