//! Canonical SQL form for content hashing (canonicalization scheme `v1`).
//!
//! Parsing drops comments, regeneration normalizes keywords and whitespace,
//! and CTE definitions are reordered alphabetically — but only when no CTE
//! forward-references another by name, because reordering would otherwise
//! change meaning for engines that resolve CTEs in declaration order.

use sqlparser::ast::{Query, Statement};

use crate::sql::backend::SqlNormalize;
use crate::sql::engine::walk::collect_tables_in_query;
use crate::sql::engine::{parse_statements, ParserEngine};
use crate::sql::types::{Dialect, NormalizedSql, SqlToolkitError};

impl SqlNormalize for ParserEngine {
    fn normalize(&self, sql: &str, dialect: Dialect) -> Result<NormalizedSql, SqlToolkitError> {
        let mut applied_rules = vec!["strip_comments", "parse_and_regenerate"];

        let mut statements = parse_statements(sql, dialect).map_err(|e| {
            SqlToolkitError::Normalize(format!(
                "Failed to canonicalize SQL: {}: {e}",
                truncate(sql, 200)
            ))
        })?;

        // A script that is only comments or whitespace normalizes to the
        // empty string.
        if statements.is_empty() {
            return Ok(NormalizedSql {
                normalized_sql: String::new(),
                original_sql: sql.to_string(),
                applied_rules,
            });
        }

        let mut reordered = false;
        for statement in &mut statements {
            if let Statement::Query(query) = statement {
                reordered |= reorder_ctes_if_safe(query);
            }
        }
        if reordered {
            applied_rules.push("reorder_ctes_alphabetically");
        }

        let normalized_sql = statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        applied_rules.push("normalize_keywords");

        Ok(NormalizedSql {
            normalized_sql,
            original_sql: sql.to_string(),
            applied_rules,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Reorder top-level CTE definitions alphabetically when no CTE references
/// one defined after it. Returns true when a reorder was applied.
fn reorder_ctes_if_safe(query: &mut Query) -> bool {
    let Some(with) = query.with.as_mut() else {
        return false;
    };
    if with.cte_tables.len() <= 1 {
        return false;
    }

    let names: Vec<String> = with
        .cte_tables
        .iter()
        .map(|cte| cte.alias.name.value.to_lowercase())
        .collect();
    let position_of: std::collections::BTreeMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    // Forward-reference check: a CTE referring to one defined later pins the
    // current order.
    for (i, cte) in with.cte_tables.iter().enumerate() {
        for table in collect_tables_in_query(&cte.query) {
            if table.schema.is_some() {
                continue;
            }
            let referenced = table.name.to_lowercase();
            if let Some(&pos) = position_of.get(referenced.as_str()) {
                if pos > i {
                    return false;
                }
            }
        }
    }

    let mut sorted = names.clone();
    sorted.sort();
    if sorted == names {
        return false;
    }

    with.cte_tables
        .sort_by(|a, b| a.alias.name.value.to_lowercase().cmp(&b.alias.name.value.to_lowercase()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::backend::SqlNormalize;

    #[test]
    fn test_comments_do_not_affect_normalized_form() {
        let engine = ParserEngine::new();
        let a = engine
            .normalize("SELECT a FROM t -- trailing comment", Dialect::Databricks)
            .expect("normalize");
        let b = engine
            .normalize("/* leading */ SELECT a\n  FROM t", Dialect::Databricks)
            .expect("normalize");
        assert_eq!(a.normalized_sql, b.normalized_sql);
        assert_eq!(a.normalized_sql, "SELECT a FROM t");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let engine = ParserEngine::new();
        let once = engine
            .normalize(
                "with b as (select 1 as x), a as (select 2 as y) select * from a, b",
                Dialect::Databricks,
            )
            .expect("normalize");
        let twice = engine
            .normalize(&once.normalized_sql, Dialect::Databricks)
            .expect("normalize");
        assert_eq!(once.normalized_sql, twice.normalized_sql);
    }

    #[test]
    fn test_ctes_reorder_alphabetically_when_safe() {
        let engine = ParserEngine::new();
        let result = engine
            .normalize(
                "WITH zeta AS (SELECT 1 AS x), alpha AS (SELECT 2 AS y) \
                 SELECT * FROM zeta JOIN alpha ON zeta.x = alpha.y",
                Dialect::Databricks,
            )
            .expect("normalize");
        assert!(result
            .applied_rules
            .contains(&"reorder_ctes_alphabetically"));
        let alpha_pos = result.normalized_sql.find("alpha AS").expect("alpha");
        let zeta_pos = result.normalized_sql.find("zeta AS").expect("zeta");
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn test_forward_referencing_ctes_keep_order() {
        let engine = ParserEngine::new();
        // `beta` references `alpha`, which is defined after it.
        let result = engine
            .normalize(
                "WITH beta AS (SELECT x FROM alpha), alpha AS (SELECT 1 AS x) \
                 SELECT * FROM beta",
                Dialect::Databricks,
            )
            .expect("normalize");
        assert!(!result
            .applied_rules
            .contains(&"reorder_ctes_alphabetically"));
        let beta_pos = result.normalized_sql.find("beta AS").expect("beta");
        let alpha_pos = result.normalized_sql.find("alpha AS").expect("alpha");
        assert!(beta_pos < alpha_pos);
    }

    #[test]
    fn test_comment_only_input_normalizes_to_empty() {
        let engine = ParserEngine::new();
        let result = engine
            .normalize("-- nothing here\n", Dialect::Databricks)
            .expect("normalize");
        assert_eq!(result.normalized_sql, "");
    }

    #[test]
    fn test_unparseable_sql_is_a_normalization_error() {
        let engine = ParserEngine::new();
        assert!(engine
            .normalize("SELECT FROM WHERE", Dialect::Databricks)
            .is_err());
    }
}
