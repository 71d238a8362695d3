//! One-shot query runner.
//!
//! Runs a single statement through the session broker and retry controller
//! and prints each row as a JSON array, one per line.
//!
//! ```text
//! plugsql_query [--config FILE] [--timing] [--timeout SECS] SQL...
//! ```
//!
//! Without SQL arguments the statement is read from stdin. Configuration
//! otherwise comes from `plugsql-config.yaml` and `PLUGSQL_*` variables.

use anyhow::{bail, Context, Result};
use clap::Parser;
use plugsql_core::config::{load_config_file, ConfigManager};
use plugsql_core::{logging, DbClient, QueryContext};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "plugsql_query")]
#[command(about = "Run one SQL statement and print the rows as JSON lines")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file to load instead of plugsql-config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fetch and print scan diagnostics after the query
    #[arg(long)]
    timing: bool,

    /// Query timeout in whole seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Statement to run; read from stdin when omitted
    #[arg(trailing_var_arg = true)]
    sql: Vec<String>,
}

impl Args {
    fn sql(&self) -> Option<String> {
        (!self.sql.is_empty()).then(|| self.sql.join(" "))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_structured_logging();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigManager::load()?.config().clone(),
    };
    if args.timing {
        config.query.timing = true;
    }

    let sql = match args.sql() {
        Some(sql) => sql,
        None => {
            let mut sql = String::new();
            io::stdin()
                .read_to_string(&mut sql)
                .context("reading SQL from stdin")?;
            sql
        }
    };
    if sql.trim().is_empty() {
        bail!("no SQL given");
    }

    let ctx = match args.timeout() {
        Some(timeout) => QueryContext::with_timeout(timeout),
        None => QueryContext::new(),
    };
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let client = DbClient::connect(config).await?;
    let outcome = run(&client, &ctx, &sql).await;
    client.close().await;
    outcome
}

async fn run(client: &DbClient, ctx: &QueryContext, sql: &str) -> Result<()> {
    let mut result = client.execute(ctx, sql, Vec::new()).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let names: Vec<&str> = result.columns().iter().map(|c| c.name.as_str()).collect();
    writeln!(out, "{}", serde_json::to_string(&names)?)?;

    while let Some(row) = result.next_row().await {
        writeln!(out, "{}", serde_json::to_string(&row?)?)?;
    }

    if let Some(diagnostics) = result.diagnostics() {
        info!(
            scans = diagnostics.scans.len(),
            rows_fetched = diagnostics.rows_fetched,
            cache_hits = diagnostics.cache_hits,
            duration_ms = diagnostics.duration_ms,
            "Query diagnostics"
        );
        eprintln!("{}", serde_json::to_string_pretty(&diagnostics)?);
    }
    Ok(())
}
