//! # Session Broker
//!
//! Leases a connection, maps it to its [`SessionInfo`], applies cache policy
//! and reconciles the search path. A session is never returned together with
//! an error: any failure after the lease drops the connection back to the pool.

use super::database_session::DatabaseSession;
use super::policy::SharedPolicy;
use super::registry::SessionRegistry;
use super::ensure_session_search_path;
use crate::constants::defaults;
use crate::context::QueryContext;
use crate::database::connection::{BackendId, ConnectionSource, SessionConnection};
use crate::database::system_calls::execute_system_call;
use crate::error::{ClientError, ClientResult};
use crate::logging;
use crate::search_path::SearchPathResolver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::warn;

/// Coordinates session initialisation with shutdown.
///
/// Every acquisition holds a read guard for its whole initialisation;
/// [`LifecycleGate::close`] takes the write side, so it waits for in-flight
/// acquisitions and turns away new ones.
#[derive(Debug, Clone, Default)]
pub struct LifecycleGate {
    closed: Arc<RwLock<bool>>,
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> ClientResult<RwLockReadGuard<'_, bool>> {
        let guard = self.closed.read().await;
        if *guard {
            return Err(ClientError::ClientClosed);
        }
        Ok(guard)
    }

    /// Mark closed once every in-flight acquisition has finished.
    pub async fn close(&self) {
        *self.closed.write().await = true;
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }
}

pub struct SessionBroker<S: ConnectionSource> {
    source: S,
    registry: Arc<SessionRegistry>,
    resolver: Arc<SearchPathResolver>,
    policy: SharedPolicy,
    gate: LifecycleGate,
    stale_attempts: u32,
    stale_backoff: Duration,
}

impl<S: ConnectionSource> SessionBroker<S> {
    pub fn new(
        source: S,
        registry: Arc<SessionRegistry>,
        resolver: Arc<SearchPathResolver>,
        policy: SharedPolicy,
        gate: LifecycleGate,
    ) -> Self {
        Self {
            source,
            registry,
            resolver,
            policy,
            gate,
            stale_attempts: defaults::STALE_CONNECTION_ATTEMPTS,
            stale_backoff: defaults::STALE_CONNECTION_BACKOFF,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<SearchPathResolver> {
        &self.resolver
    }

    pub fn policy(&self) -> &SharedPolicy {
        &self.policy
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Acquire a session ready for queries.
    pub async fn acquire(&self, ctx: &QueryContext) -> ClientResult<DatabaseSession<S::Connection>> {
        ctx.check()?;
        let _gate = self.gate.enter().await?;
        let started = Instant::now();

        let (connection, backend_id) = self.lease_live(ctx).await?;
        let info = self.registry.checkout(backend_id);
        let mut session = DatabaseSession::new(backend_id, connection, info)
            .registered_in(Arc::clone(&self.registry));

        if let Err(err) = self.initialise(ctx, &mut session).await {
            // Interrupted mid-transaction: the connection state is unknown.
            if err.is_cancellation() {
                session.mark_broken();
            }
            logging::log_session_operation(
                "acquire",
                Some(backend_id),
                "failed",
                Some(started.elapsed().as_millis() as u64),
                Some(&err.to_string()),
            );
            return Err(err);
        }

        logging::log_session_operation(
            "acquire",
            Some(backend_id),
            "ok",
            Some(started.elapsed().as_millis() as u64),
            None,
        );
        Ok(session)
    }

    /// Lease until a connection answers its backend-id query, replacing dead
    /// handles a bounded number of times.
    async fn lease_live(&self, ctx: &QueryContext) -> ClientResult<(S::Connection, BackendId)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut connection = self.source.lease(ctx).await?;

            match ctx.run(connection.backend_id()).await {
                Ok(backend_id) => return Ok((connection, backend_id)),
                Err(err) if err.is_stale_connection() => {
                    connection.mark_broken();
                    drop(connection);
                    self.source.record_stale();

                    if attempt >= self.stale_attempts {
                        return Err(err);
                    }
                    warn!(
                        attempt = attempt,
                        error = %err,
                        "🔌 SESSION: Leased connection is dead, leasing another"
                    );
                    ctx.sleep(self.stale_backoff).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn initialise(
        &self,
        ctx: &QueryContext,
        session: &mut DatabaseSession<S::Connection>,
    ) -> ClientResult<()> {
        let calls = self.policy.read().cache_calls();
        for call in calls {
            ctx.run(execute_system_call(session.connection_mut(), call))
                .await?;
        }

        ensure_session_search_path(ctx, session, &self.resolver).await?;
        Ok(())
    }
}
