//! # Query Execution
//!
//! Value model, row conversion, streaming results, scan diagnostics and the
//! executor that ties them to a session.

pub mod conversion;
pub mod diagnostics;
pub mod executor;
pub mod result;
pub mod types;

pub use diagnostics::{QueryDiagnostics, ScanMetadata};
pub use executor::{CompletionCallback, ExecOptions, QueryExecutor};
pub use result::{StreamOutcome, StreamingResult};
pub use types::{ColumnMeta, QueryArg, ResultRow, SyncQueryResult, Value};
