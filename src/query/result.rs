//! Streaming query results.

use crate::error::{ClientError, ClientResult};
use crate::query::diagnostics::QueryDiagnostics;
use crate::query::types::{ColumnMeta, ResultRow, SyncQueryResult};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// What the row pump leaves behind once the stream has closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub error: Option<ClientError>,
    pub diagnostics: Option<QueryDiagnostics>,
    pub rows_returned: u64,
    pub complete: bool,
}

pub(crate) type SharedOutcome = Arc<Mutex<StreamOutcome>>;

/// Rows of a running query, delivered as they arrive.
///
/// Single pass: once drained it yields nothing more. A row-read failure is
/// yielded once as the final item and is also available from
/// [`StreamingResult::error`]. The session stays busy until the stream is
/// drained or the result is dropped.
#[derive(Debug)]
pub struct StreamingResult {
    columns: Vec<ColumnMeta>,
    rows: mpsc::Receiver<ResultRow>,
    outcome: SharedOutcome,
    closed: bool,
}

impl StreamingResult {
    pub(crate) fn new(
        columns: Vec<ColumnMeta>,
        rows: mpsc::Receiver<ResultRow>,
        outcome: SharedOutcome,
    ) -> Self {
        Self {
            columns,
            rows,
            outcome,
            closed: false,
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Next row, the terminal error, or `None` once closed.
    pub async fn next_row(&mut self) -> Option<ClientResult<ResultRow>> {
        self.next().await
    }

    /// Terminal error. Only meaningful once the stream has closed.
    pub fn error(&self) -> Option<ClientError> {
        self.outcome.lock().error.clone()
    }

    /// Scan diagnostics, populated before the stream closes when timing is on.
    pub fn diagnostics(&self) -> Option<QueryDiagnostics> {
        self.outcome.lock().diagnostics.clone()
    }

    pub fn rows_returned(&self) -> u64 {
        self.outcome.lock().rows_returned
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain every row, failing with the terminal error if there is one.
    pub async fn collect_rows(mut self) -> ClientResult<SyncQueryResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(SyncQueryResult {
            columns: std::mem::take(&mut self.columns),
            rows,
            diagnostics: self.diagnostics(),
        })
    }
}

impl Stream for StreamingResult {
    type Item = ClientResult<ResultRow>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }
        match this.rows.poll_recv(cx) {
            Poll::Ready(Some(row)) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(None) => {
                this.closed = true;
                Poll::Ready(this.outcome.lock().error.clone().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::Value;

    fn result_with(rows: Vec<ResultRow>, error: Option<ClientError>) -> StreamingResult {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(row).unwrap();
        }
        drop(tx);
        let outcome = Arc::new(Mutex::new(StreamOutcome {
            error,
            complete: true,
            ..Default::default()
        }));
        StreamingResult::new(vec![ColumnMeta::new("n", "INT8")], rx, outcome)
    }

    #[tokio::test]
    async fn test_error_is_yielded_once_after_rows() {
        let mut result = result_with(
            vec![vec![Value::Int(1)]],
            Some(ClientError::ConnectionLost("reset".into())),
        );

        assert_eq!(result.next_row().await, Some(Ok(vec![Value::Int(1)])));
        assert!(matches!(result.next_row().await, Some(Err(ClientError::ConnectionLost(_)))));
        assert_eq!(result.next_row().await, None);
        assert!(result.is_closed());
    }

    #[tokio::test]
    async fn test_collect_rows_surfaces_error() {
        let result = result_with(vec![vec![Value::Int(1)]], Some(ClientError::Cancelled));
        assert_eq!(result.collect_rows().await, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_collect_rows_returns_columns() {
        let result = result_with(vec![vec![Value::Int(1)], vec![Value::Int(2)]], None);
        let collected = result.collect_rows().await.unwrap();
        assert_eq!(collected.row_count(), 2);
        assert_eq!(collected.columns[0].name, "n");
    }
}
