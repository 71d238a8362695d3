//! Scan diagnostics fetched after a query's rows have been streamed.
//!
//! The loader appends one row per scan to the scan metadata table. Each
//! session remembers the highest id it has read so a fetch only sees scans
//! produced since the previous one.

use crate::constants::{INTERNAL_SCHEMA, SCAN_METADATA_TABLE};
use crate::context::QueryContext;
use crate::database::connection::SessionConnection;
use crate::error::{ClientError, ClientResult};
use crate::query::executor::collect_internal;
use crate::query::types::{QueryArg, ResultRow, Value};
use crate::session::DatabaseSession;
use serde::Serialize;

/// One scan performed while answering a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanMetadata {
    pub id: i64,
    pub connection: String,
    pub table: String,
    pub rows_fetched: i64,
    pub cache_hit: bool,
    pub hydrate_calls: i64,
}

/// Aggregated diagnostics for one query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryDiagnostics {
    pub scans: Vec<ScanMetadata>,
    pub rows_fetched: i64,
    pub cache_hits: u64,
    pub hydrate_calls: i64,
    pub duration_ms: u64,
}

impl QueryDiagnostics {
    pub fn from_scans(scans: Vec<ScanMetadata>, duration_ms: u64) -> Self {
        Self {
            rows_fetched: scans.iter().map(|s| s.rows_fetched).sum(),
            cache_hits: scans.iter().filter(|s| s.cache_hit).count() as u64,
            hydrate_calls: scans.iter().map(|s| s.hydrate_calls).sum(),
            scans,
            duration_ms,
        }
    }
}

pub fn scan_metadata_query() -> String {
    format!(
        "SELECT id, connection, \"table\", rows_fetched, cache_hit, hydrate_calls \
         FROM {INTERNAL_SCHEMA}.{SCAN_METADATA_TABLE} WHERE id > $1 ORDER BY id"
    )
}

pub fn max_scan_metadata_id_query() -> String {
    format!("SELECT COALESCE(MAX(id), 0) FROM {INTERNAL_SCHEMA}.{SCAN_METADATA_TABLE}")
}

/// Read scans newer than both the session watermark and `baseline`, then
/// advance the watermark past them.
///
/// Runs through [`collect_internal`], so it never fetches diagnostics of its own.
pub async fn fetch_new_scans<C: SessionConnection>(
    ctx: &QueryContext,
    session: &mut DatabaseSession<C>,
    baseline: i64,
    duration_ms: u64,
) -> ClientResult<QueryDiagnostics> {
    let after = session.info().scan_metadata_watermark().max(baseline);
    let rows = collect_internal(
        ctx,
        session,
        &scan_metadata_query(),
        &[QueryArg::Int(after)],
    )
    .await?;

    let scans = rows
        .iter()
        .map(parse_scan_row)
        .collect::<ClientResult<Vec<_>>>()?;
    if let Some(last) = scans.last() {
        session.info().advance_watermark(last.id);
    }
    Ok(QueryDiagnostics::from_scans(scans, duration_ms))
}

fn parse_scan_row(row: &ResultRow) -> ClientResult<ScanMetadata> {
    let [id, connection, table, rows_fetched, cache_hit, hydrate_calls] = row.as_slice() else {
        return Err(ClientError::DecodeError(format!(
            "scan metadata row has {} columns, expected 6",
            row.len()
        )));
    };
    Ok(ScanMetadata {
        id: int(id, "id")?,
        connection: text(connection),
        table: text(table),
        rows_fetched: int(rows_fetched, "rows_fetched")?,
        cache_hit: cache_hit.as_bool().unwrap_or(false),
        hydrate_calls: int(hydrate_calls, "hydrate_calls")?,
    })
}

fn int(value: &Value, column: &str) -> ClientResult<i64> {
    match value {
        Value::Null => Ok(0),
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(*f as i64),
        other => Err(ClientError::DecodeError(format!(
            "scan metadata column {column}: expected integer, got {other:?}"
        ))),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInfo;
    use crate::test_helpers::FakeConnection;
    use std::sync::Arc;

    fn scan_row(id: i64, rows: i64, hit: bool) -> ClientResult<ResultRow> {
        Ok(vec![
            Value::Int(id),
            Value::Text("aws".into()),
            Value::Text("aws_s3_bucket".into()),
            Value::Int(rows),
            Value::Bool(hit),
            Value::Int(2),
        ])
    }

    #[tokio::test]
    async fn test_fetch_uses_and_advances_watermark() {
        let conn = FakeConnection::new(1);
        conn.set_rows(
            SCAN_METADATA_TABLE,
            vec![scan_row(5, 10, false), scan_row(6, 3, true)],
        );
        let info = Arc::new(SessionInfo::new(1));
        info.advance_watermark(4);
        let mut session = DatabaseSession::new(1, conn.clone(), Arc::clone(&info));

        let diagnostics = fetch_new_scans(&QueryContext::new(), &mut session, 2, 12)
            .await
            .unwrap();

        assert_eq!(diagnostics.scans.len(), 2);
        assert_eq!(diagnostics.rows_fetched, 13);
        assert_eq!(diagnostics.cache_hits, 1);
        assert_eq!(diagnostics.hydrate_calls, 4);
        assert_eq!(info.scan_metadata_watermark(), 6);
        assert_eq!(conn.fetched()[0].1, vec![QueryArg::Int(4)]);
    }

    #[tokio::test]
    async fn test_baseline_beats_lower_watermark() {
        let conn = FakeConnection::new(1);
        let mut session = DatabaseSession::new(1, conn.clone(), Arc::new(SessionInfo::new(1)));

        let diagnostics = fetch_new_scans(&QueryContext::new(), &mut session, 40, 0)
            .await
            .unwrap();

        assert!(diagnostics.scans.is_empty());
        assert_eq!(conn.fetched()[0].1, vec![QueryArg::Int(40)]);
        assert_eq!(session.info().scan_metadata_watermark(), 0);
    }

    #[test]
    fn test_short_row_is_rejected() {
        assert!(parse_scan_row(&vec![Value::Int(1)]).is_err());
    }
}
