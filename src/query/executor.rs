//! # Query Executor
//!
//! Starts a query on a session (through the schema retry controller) and
//! hands back a [`StreamingResult`] fed by a background row pump. Once the
//! rows are exhausted the pump, in order: fetches scan diagnostics, hands the
//! session to the completion callback (or releases it) and closes the stream.

use crate::context::QueryContext;
use crate::database::connection::SessionConnection;
use crate::error::{ClientError, ClientResult};
use crate::logging;
use crate::query::diagnostics::fetch_new_scans;
use crate::query::result::{SharedOutcome, StreamOutcome, StreamingResult};
use crate::query::types::{QueryArg, ResultRow};
use crate::resilience::SchemaRetryController;
use crate::session::{DatabaseSession, SharedPolicy};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// Receives the session once its rows are fully drained.
pub type CompletionCallback<C> = Box<dyn FnOnce(DatabaseSession<C>) + Send + 'static>;

/// Per-execution switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Route the start through the schema retry controller
    pub retry_missing_schema: bool,
    /// Fetch scan diagnostics after the rows, when timing is enabled
    pub fetch_diagnostics: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            retry_missing_schema: true,
            fetch_diagnostics: true,
        }
    }
}

impl ExecOptions {
    /// Bookkeeping queries: no retry and never diagnostics of their own.
    pub fn internal() -> Self {
        Self {
            retry_missing_schema: false,
            fetch_diagnostics: false,
        }
    }
}

pub struct QueryExecutor {
    retry: Arc<SchemaRetryController>,
    policy: SharedPolicy,
}

impl QueryExecutor {
    pub fn new(retry: Arc<SchemaRetryController>, policy: SharedPolicy) -> Self {
        Self { retry, policy }
    }

    pub fn retry_controller(&self) -> &Arc<SchemaRetryController> {
        &self.retry
    }

    /// Start `sql` on `session` and stream its rows.
    ///
    /// The session moves into the row pump. It comes back through
    /// `on_complete` once the rows are drained, the stream fails, or the
    /// result is dropped; without a callback it is released to the pool. A
    /// failed start also goes through `on_complete` before the error returns.
    pub async fn execute<C: SessionConnection>(
        &self,
        ctx: &QueryContext,
        mut session: DatabaseSession<C>,
        sql: impl Into<String>,
        args: Vec<QueryArg>,
        options: ExecOptions,
        on_complete: Option<CompletionCallback<C>>,
    ) -> ClientResult<StreamingResult> {
        let sql = sql.into();
        let (timeout, timing_enabled, baseline) = {
            let policy = self.policy.read();
            (
                policy.query_timeout,
                policy.timing_enabled,
                policy.diagnostics_baseline,
            )
        };
        let query_ctx = ctx.child_with_timeout(timeout);
        let started = Instant::now();

        let start = if options.retry_missing_schema {
            self.retry
                .start_with_retry(&query_ctx, &mut session, &sql)
                .await
        } else {
            query_ctx.run(session.connection_mut().prepare(&sql)).await
        };

        let columns = match start {
            Ok(columns) => columns,
            Err(err) => {
                logging::log_query_operation(
                    "start",
                    Some(session.backend_id()),
                    "failed",
                    None,
                    Some(started.elapsed().as_millis() as u64),
                    Some(&err.to_string()),
                );
                release(session, on_complete);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let outcome: SharedOutcome = Arc::new(Mutex::new(StreamOutcome::default()));
        let pump = RowPump {
            ctx: query_ctx,
            session,
            sql,
            args,
            rows: tx,
            outcome: Arc::clone(&outcome),
            fetch_diagnostics: options.fetch_diagnostics && timing_enabled,
            baseline,
            on_complete,
            started,
        };
        tokio::spawn(pump.run());

        Ok(StreamingResult::new(columns, rx, outcome))
    }
}

fn release<C: SessionConnection>(
    session: DatabaseSession<C>,
    on_complete: Option<CompletionCallback<C>>,
) {
    match on_complete {
        Some(callback) => callback(session),
        None => drop(session),
    }
}

/// Prepare and drain `sql` inline. Used for bookkeeping queries on a session
/// the caller already holds; never retries and never fetches diagnostics.
pub async fn collect_internal<C: SessionConnection>(
    ctx: &QueryContext,
    session: &mut DatabaseSession<C>,
    sql: &str,
    args: &[QueryArg],
) -> ClientResult<Vec<ResultRow>> {
    ctx.run(session.connection_mut().prepare(sql)).await?;
    ctx.run(session.connection_mut().fetch_all(sql, args)).await
}

struct RowPump<C: SessionConnection> {
    ctx: QueryContext,
    session: DatabaseSession<C>,
    sql: String,
    args: Vec<QueryArg>,
    rows: mpsc::Sender<ResultRow>,
    outcome: SharedOutcome,
    fetch_diagnostics: bool,
    baseline: i64,
    on_complete: Option<CompletionCallback<C>>,
    started: Instant,
}

impl<C: SessionConnection> RowPump<C> {
    async fn run(self) {
        let RowPump {
            ctx,
            mut session,
            sql,
            args,
            rows: tx,
            outcome,
            fetch_diagnostics,
            baseline,
            on_complete,
            started,
        } = self;

        let mut rows_returned: u64 = 0;
        let mut error: Option<ClientError> = None;
        let mut abandoned = false;

        {
            let mut stream = session.connection_mut().fetch(&sql, &args);
            loop {
                let next = ctx.run(async { Ok(stream.next().await) }).await;
                let row = match next {
                    Ok(Some(Ok(row))) => row,
                    Ok(Some(Err(err))) | Err(err) => {
                        error = Some(err);
                        break;
                    }
                    Ok(None) => break,
                };

                match ctx.run(async { Ok(tx.send(row).await.is_ok()) }).await {
                    Ok(true) => rows_returned += 1,
                    Ok(false) => {
                        abandoned = true;
                        break;
                    }
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }
        }

        // A query cut off mid-result leaves the wire in an unknown state.
        let interrupted = abandoned || error.as_ref().is_some_and(ClientError::is_cancellation);
        if interrupted {
            session.mark_broken();
        }

        let diagnostics = if fetch_diagnostics && !interrupted {
            let duration_ms = started.elapsed().as_millis() as u64;
            match fetch_new_scans(&ctx, &mut session, baseline, duration_ms).await {
                Ok(diagnostics) => Some(diagnostics),
                Err(err) => {
                    warn!(
                        backend_id = session.backend_id(),
                        error = %err,
                        "Failed to fetch scan diagnostics"
                    );
                    None
                }
            }
        } else {
            None
        };

        logging::log_query_operation(
            "stream",
            Some(session.backend_id()),
            match (&error, abandoned) {
                (Some(_), _) => "failed",
                (None, true) => "abandoned",
                (None, false) => "complete",
            },
            Some(rows_returned),
            Some(started.elapsed().as_millis() as u64),
            error.as_ref().map(ToString::to_string).as_deref(),
        );

        {
            let mut outcome = outcome.lock();
            outcome.error = error;
            outcome.diagnostics = diagnostics;
            outcome.rows_returned = rows_returned;
            outcome.complete = true;
        }

        release(session, on_complete);
        drop(tx);
    }
}
