//! # Session Management
//!
//! A [`DatabaseSession`] binds a leased physical connection to what is
//! already known about it: its backend identifier, the search path last set
//! on it, usage counters and the diagnostics watermark. The
//! [`SessionBroker`] hands sessions out with cache policy applied and the
//! search path reconciled.

pub mod broker;
pub mod database_session;
pub mod policy;
pub mod registry;

pub use broker::{LifecycleGate, SessionBroker};
pub use database_session::{DatabaseSession, SessionInfo};
pub use policy::{SessionPolicy, SharedPolicy};
pub use registry::SessionRegistry;

use crate::context::QueryContext;
use crate::database::connection::SessionConnection;
use crate::error::ClientResult;
use crate::search_path::SearchPathResolver;
use tracing::debug;

/// Quote a schema name as an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `SET search_path` statement for `search_path`. An empty path resets to
/// the server default.
pub fn set_search_path_statement(search_path: &[String]) -> String {
    if search_path.is_empty() {
        return "SET search_path TO DEFAULT".to_string();
    }
    let schemas: Vec<String> = search_path.iter().map(|s| quote_ident(s)).collect();
    format!("SET search_path TO {}", schemas.join(", "))
}

/// Make the session's search path match the resolver's required path.
///
/// Issues a `SET` only when the cached path differs. Returns whether a
/// statement was sent.
pub async fn ensure_session_search_path<C: SessionConnection>(
    ctx: &QueryContext,
    session: &mut DatabaseSession<C>,
    resolver: &SearchPathResolver,
) -> ClientResult<bool> {
    let required = resolver.required_search_path();
    if session.info().search_path() == required {
        return Ok(false);
    }

    let statement = set_search_path_statement(&required);
    ctx.run(session.connection_mut().execute(&statement)).await?;

    debug!(
        backend_id = session.backend_id(),
        search_path = ?required,
        "Session search path updated"
    );
    session.info().set_search_path(required);
    Ok(true)
}
