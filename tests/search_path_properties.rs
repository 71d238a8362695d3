//! Property tests for the required search path.

use plugsql_core::constants::INTERNAL_SCHEMA;
use plugsql_core::search_path::{compute_required_search_path, parse_search_path};
use proptest::prelude::*;
use std::collections::HashSet;

fn schema_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}"
}

fn schemas_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(schema_strategy(), 0..8)
}

proptest! {
    /// No schema appears twice in the required path
    #[test]
    fn required_path_has_no_duplicates(
        user in schemas_strategy(),
        override_path in schemas_strategy(),
        prefix in schemas_strategy(),
    ) {
        let required = compute_required_search_path(&user, &override_path, &prefix);
        let unique: HashSet<&String> = required.iter().collect();
        prop_assert_eq!(unique.len(), required.len());
    }

    /// Prefix entries lead, in their own order
    #[test]
    fn prefix_comes_first(user in schemas_strategy(), prefix in schemas_strategy()) {
        let required = compute_required_search_path(&user, &[], &prefix);
        let mut deduped_prefix: Vec<String> = Vec::new();
        for schema in &prefix {
            if !deduped_prefix.contains(schema) {
                deduped_prefix.push(schema.clone());
            }
        }
        prop_assert_eq!(&required[..deduped_prefix.len()], deduped_prefix.as_slice());
    }

    /// An override always keeps the internal schema reachable and hides the user path
    #[test]
    fn override_keeps_internal_schema(
        user in schemas_strategy(),
        override_path in prop::collection::vec(schema_strategy(), 1..6),
    ) {
        let required = compute_required_search_path(&user, &override_path, &[]);
        prop_assert!(required.iter().any(|s| s == INTERNAL_SCHEMA));
        for schema in &required {
            prop_assert!(override_path.contains(schema) || schema == INTERNAL_SCHEMA);
        }
    }

    /// Without an override or prefix the user path passes through deduplicated
    #[test]
    fn user_path_passes_through(user in schemas_strategy()) {
        let required = compute_required_search_path(&user, &[], &[]);
        for schema in &user {
            prop_assert!(required.contains(schema));
        }
        prop_assert!(required.len() <= user.len());
    }

    /// Parsing a rendered setting yields the original schemas
    #[test]
    fn parse_reads_rendered_setting(schemas in prop::collection::vec(schema_strategy(), 1..8)) {
        let rendered = schemas
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ");
        prop_assert_eq!(parse_search_path(&rendered), schemas);
    }
}
