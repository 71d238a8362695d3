//! # System Calls
//!
//! Cache controls exposed by the plugin loader as SQL functions. Each call
//! runs in its own transaction with the connection's application name
//! swapped to [`application_names::SYSTEM`] so the loader can tell it apart
//! from user queries. `SET LOCAL` reverts the tag at commit or rollback.

use crate::constants::{application_names, system_functions, INTERNAL_SCHEMA};
use crate::database::connection::SessionConnection;
use crate::error::{ClientError, ClientResult};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    CacheEnable,
    CacheDisable,
    CacheTtl(Duration),
    CacheClear,
}

impl SystemCall {
    pub fn name(&self) -> &'static str {
        match self {
            SystemCall::CacheEnable => "cache_enable",
            SystemCall::CacheDisable => "cache_disable",
            SystemCall::CacheTtl(_) => "cache_ttl",
            SystemCall::CacheClear => "cache_clear",
        }
    }

    /// The function invocation for this call.
    pub fn statement(&self) -> String {
        match self {
            SystemCall::CacheEnable => cache_statement(system_functions::CACHE_ON),
            SystemCall::CacheDisable => cache_statement(system_functions::CACHE_OFF),
            SystemCall::CacheClear => cache_statement(system_functions::CACHE_CLEAR),
            SystemCall::CacheTtl(ttl) => format!(
                "SELECT {INTERNAL_SCHEMA}.{}({})",
                system_functions::META_CACHE_TTL,
                ttl.as_secs()
            ),
        }
    }
}

impl fmt::Display for SystemCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemCall::CacheTtl(ttl) => write!(f, "{}({}s)", self.name(), ttl.as_secs()),
            _ => write!(f, "{}", self.name()),
        }
    }
}

fn cache_statement(command: &str) -> String {
    format!(
        "SELECT {INTERNAL_SCHEMA}.{}('{command}')",
        system_functions::META_CACHE
    )
}

/// Run `call` on `conn` inside a tagged transaction.
///
/// Any failure rolls the transaction back (best effort) and is reported as
/// [`ClientError::SystemCallError`].
pub async fn execute_system_call<C>(conn: &mut C, call: SystemCall) -> ClientResult<()>
where
    C: SessionConnection + ?Sized,
{
    debug!(call = %call, "Executing system call");

    match run_in_transaction(conn, call).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(rollback_err) = conn.execute("ROLLBACK").await {
                warn!(call = %call, error = %rollback_err, "System call rollback failed");
            }
            Err(ClientError::SystemCallError {
                call: call.to_string(),
                message: err.to_string(),
            })
        }
    }
}

async fn run_in_transaction<C>(conn: &mut C, call: SystemCall) -> ClientResult<()>
where
    C: SessionConnection + ?Sized,
{
    conn.execute("BEGIN").await?;
    conn.execute(&format!(
        "SET LOCAL application_name = '{}'",
        application_names::SYSTEM
    ))
    .await?;
    conn.execute(&call.statement()).await?;
    conn.execute("COMMIT").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeConnection;

    #[test]
    fn test_statements() {
        assert_eq!(
            SystemCall::CacheEnable.statement(),
            "SELECT plugsql_internal.meta_cache('on')"
        );
        assert_eq!(
            SystemCall::CacheClear.statement(),
            "SELECT plugsql_internal.meta_cache('clear')"
        );
        assert_eq!(
            SystemCall::CacheTtl(Duration::from_secs(300)).statement(),
            "SELECT plugsql_internal.meta_cache_ttl(300)"
        );
    }

    #[tokio::test]
    async fn test_call_is_wrapped_in_tagged_transaction() {
        let mut conn = FakeConnection::new(1);
        execute_system_call(&mut conn, SystemCall::CacheDisable)
            .await
            .unwrap();

        assert_eq!(
            conn.statements(),
            vec![
                "BEGIN".to_string(),
                "SET LOCAL application_name = 'plugsql_client_system'".to_string(),
                "SELECT plugsql_internal.meta_cache('off')".to_string(),
                "COMMIT".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_names_call() {
        let mut conn = FakeConnection::new(1);
        conn.fail_execute_containing(
            "meta_cache_ttl",
            ClientError::database("42883", "function does not exist"),
        );

        let err = execute_system_call(&mut conn, SystemCall::CacheTtl(Duration::from_secs(5)))
            .await
            .unwrap_err();

        match err {
            ClientError::SystemCallError { call, message } => {
                assert_eq!(call, "cache_ttl(5s)");
                assert!(message.contains("function does not exist"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(conn.statements().last().map(String::as_str), Some("ROLLBACK"));
    }
}
