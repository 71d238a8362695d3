//! # Search Path Resolver
//!
//! Computes the search path every session must carry from three inputs:
//!
//! - the user search path stored server-side for the login role
//! - an optional operator override, which replaces the user path and always
//!   keeps the internal schema reachable
//! - an optional prefix, placed first
//!
//! ```rust
//! use plugsql_core::search_path::compute_required_search_path;
//!
//! let user = vec!["aws".to_string(), "public".to_string()];
//! let prefix = vec!["gcp".to_string(), "aws".to_string()];
//! assert_eq!(
//!     compute_required_search_path(&user, &[], &prefix),
//!     vec!["gcp", "aws", "public"]
//! );
//! ```

use crate::constants::INTERNAL_SCHEMA;
use crate::context::QueryContext;
use crate::error::ClientResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Where the user search path lives.
#[async_trait]
pub trait UserSearchPathSource: Send + Sync {
    async fn load_user_search_path(&self, ctx: &QueryContext) -> ClientResult<Vec<String>>;
}

/// Required search path for the given inputs.
///
/// Prefix entries come first in their own order; base entries already
/// present are dropped. No schema appears twice.
pub fn compute_required_search_path(
    user_search_path: &[String],
    override_search_path: &[String],
    prefix: &[String],
) -> Vec<String> {
    let mut base: Vec<String> = if override_search_path.is_empty() {
        user_search_path.to_vec()
    } else {
        override_search_path.to_vec()
    };
    if !override_search_path.is_empty() && !base.iter().any(|s| s == INTERNAL_SCHEMA) {
        base.push(INTERNAL_SCHEMA.to_string());
    }

    let mut required: Vec<String> = Vec::with_capacity(prefix.len() + base.len());
    for schema in prefix.iter().chain(base.iter()) {
        if !required.contains(schema) {
            required.push(schema.clone());
        }
    }
    required
}

/// Parse a `search_path` setting such as `"$user", public, aws`.
pub fn parse_search_path(setting: &str) -> Vec<String> {
    setting
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .map(|inner| inner.replace("\"\"", "\""))
                .unwrap_or_else(|| s.to_string())
        })
        .collect()
}

#[derive(Debug, Default)]
struct ResolverState {
    user_search_path: Vec<String>,
    override_search_path: Vec<String>,
    prefix: Vec<String>,
}

pub struct SearchPathResolver {
    source: Option<Arc<dyn UserSearchPathSource>>,
    state: RwLock<ResolverState>,
}

impl std::fmt::Debug for SearchPathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPathResolver")
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl SearchPathResolver {
    pub fn new(source: Option<Arc<dyn UserSearchPathSource>>) -> Self {
        Self {
            source,
            state: RwLock::new(ResolverState::default()),
        }
    }

    /// Set the operator override and prefix. Empty lists mean "not configured".
    pub fn configure(&self, override_search_path: Vec<String>, prefix: Vec<String>) {
        let mut state = self.state.write();
        state.override_search_path = override_search_path;
        state.prefix = prefix;
    }

    pub fn set_user_search_path(&self, search_path: Vec<String>) {
        self.state.write().user_search_path = search_path;
    }

    /// Re-read the user search path from the server. A resolver without a
    /// source keeps whatever was set explicitly.
    pub async fn refresh_user_search_path(&self, ctx: &QueryContext) -> ClientResult<Vec<String>> {
        let Some(source) = &self.source else {
            return Ok(self.user_search_path());
        };
        let search_path = ctx.run(source.load_user_search_path(ctx)).await?;
        debug!(search_path = ?search_path, "User search path refreshed");
        self.set_user_search_path(search_path.clone());
        Ok(search_path)
    }

    pub fn user_search_path(&self) -> Vec<String> {
        self.state.read().user_search_path.clone()
    }

    pub fn override_active(&self) -> bool {
        !self.state.read().override_search_path.is_empty()
    }

    pub fn required_search_path(&self) -> Vec<String> {
        let state = self.state.read();
        compute_required_search_path(
            &state.user_search_path,
            &state.override_search_path,
            &state.prefix,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeSearchPathSource;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_user_path_without_override() {
        let required = compute_required_search_path(&strings(&["aws", "public"]), &[], &[]);
        assert_eq!(required, strings(&["aws", "public"]));
    }

    #[test]
    fn test_override_appends_internal_schema() {
        let required = compute_required_search_path(
            &strings(&["aws", "public"]),
            &strings(&["gcp"]),
            &[],
        );
        assert_eq!(required, strings(&["gcp", INTERNAL_SCHEMA]));
    }

    #[test]
    fn test_override_keeps_existing_internal_position() {
        let required = compute_required_search_path(
            &[],
            &strings(&[INTERNAL_SCHEMA, "gcp"]),
            &[],
        );
        assert_eq!(required, strings(&[INTERNAL_SCHEMA, "gcp"]));
    }

    #[test]
    fn test_prefix_wins_ordering() {
        let required = compute_required_search_path(
            &strings(&["aws", "gcp", "public"]),
            &[],
            &strings(&["gcp", "azure", "gcp"]),
        );
        assert_eq!(required, strings(&["gcp", "azure", "aws", "public"]));
    }

    #[test]
    fn test_parse_search_path() {
        assert_eq!(
            parse_search_path("\"$user\", public , aws"),
            strings(&["$user", "public", "aws"])
        );
        assert_eq!(parse_search_path("\"odd\"\"name\""), strings(&["odd\"name"]));
        assert!(parse_search_path("").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_reads_source() {
        let source = Arc::new(FakeSearchPathSource::new(strings(&["aws"])));
        let resolver = SearchPathResolver::new(Some(source.clone()));
        resolver.configure(Vec::new(), strings(&["extra"]));

        resolver
            .refresh_user_search_path(&QueryContext::new())
            .await
            .unwrap();
        assert_eq!(resolver.required_search_path(), strings(&["extra", "aws"]));

        source.set(strings(&["azure"]));
        resolver
            .refresh_user_search_path(&QueryContext::new())
            .await
            .unwrap();
        assert_eq!(resolver.required_search_path(), strings(&["extra", "azure"]));
        assert_eq!(source.load_count(), 2);
    }

    #[test]
    fn test_override_active_flag() {
        let resolver = SearchPathResolver::new(None);
        assert!(!resolver.override_active());
        resolver.configure(strings(&["aws"]), Vec::new());
        assert!(resolver.override_active());
    }
}
