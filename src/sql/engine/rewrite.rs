//! Catalog/schema rewriting of table references.
//!
//! Rewrites happen by AST mutation, never string replacement, so quoted
//! identifiers, CTEs, and subqueries are handled correctly. Rules match
//! fully-qualified, schema-qualified, catalog-qualified, and unqualified
//! tables in that order of specificity.

use std::collections::BTreeSet;

use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor,
    TableWithJoins,
};

use crate::sql::backend::SqlRewrite;
use crate::sql::engine::walk::{collect_cte_names, table_ref_from};
use crate::sql::engine::{parse_statements, ParserEngine};
use crate::sql::types::{Dialect, RewriteResult, RewriteRule, TableRef};

impl SqlRewrite for ParserEngine {
    fn rewrite_tables(
        &self,
        sql: &str,
        rules: &[RewriteRule],
        dialect: Dialect,
    ) -> RewriteResult {
        if rules.is_empty() {
            return RewriteResult {
                rewritten_sql: sql.to_string(),
                tables_rewritten: Vec::new(),
                tables_unchanged: Vec::new(),
            };
        }

        let mut statements = match parse_statements(sql, dialect) {
            Ok(statements) if !statements.is_empty() => statements,
            Ok(_) => {
                return RewriteResult {
                    rewritten_sql: sql.to_string(),
                    tables_rewritten: Vec::new(),
                    tables_unchanged: Vec::new(),
                };
            }
            Err(err) => {
                tracing::warn!("parse error during rewrite; returning original SQL: {err}");
                return RewriteResult {
                    rewritten_sql: sql.to_string(),
                    tables_rewritten: Vec::new(),
                    tables_unchanged: Vec::new(),
                };
            }
        };

        let mut outcome = RewriteOutcome::default();
        for statement in &mut statements {
            // References to CTE names are scope-local and never rewritten.
            let cte_names = collect_cte_names(statement);
            rewrite_statement(statement, rules, &cte_names, &mut outcome);
        }

        let rewritten_sql = statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ");

        outcome.rewritten.sort_by_key(|t| t.fully_qualified());
        outcome.rewritten.dedup();
        outcome.unchanged.sort_by_key(|t| t.fully_qualified());
        outcome.unchanged.dedup();

        RewriteResult {
            rewritten_sql,
            tables_rewritten: outcome.rewritten,
            tables_unchanged: outcome.unchanged,
        }
    }

    fn quote_identifier(&self, name: &str, dialect: Dialect) -> String {
        let quote = match dialect {
            Dialect::Databricks => '`',
            _ => '"',
        };
        Ident::with_quote(quote, name).to_string()
    }
}

#[derive(Default)]
struct RewriteOutcome {
    rewritten: Vec<TableRef>,
    unchanged: Vec<TableRef>,
}

fn rewrite_statement(
    statement: &mut Statement,
    rules: &[RewriteRule],
    cte_names: &BTreeSet<String>,
    outcome: &mut RewriteOutcome,
) {
    match statement {
        Statement::Query(query) => rewrite_query(query, rules, cte_names, outcome),
        Statement::Insert(insert) => {
            if let Some(source) = insert.source.as_mut() {
                rewrite_query(source, rules, cte_names, outcome);
            }
        }
        Statement::CreateTable(create) => {
            if let Some(query) = create.query.as_mut() {
                rewrite_query(query, rules, cte_names, outcome);
            }
        }
        Statement::CreateView { query, .. } => rewrite_query(query, rules, cte_names, outcome),
        _ => {}
    }
}

fn rewrite_query(query: &mut Query, rules: &[RewriteRule], cte_names: &BTreeSet<String>, outcome: &mut RewriteOutcome) {
    if let Some(with) = query.with.as_mut() {
        for cte in &mut with.cte_tables {
            rewrite_query(&mut cte.query, rules, cte_names, outcome);
        }
    }
    rewrite_set_expr(&mut query.body, rules, cte_names, outcome);
}

fn rewrite_set_expr(body: &mut SetExpr, rules: &[RewriteRule], cte_names: &BTreeSet<String>, outcome: &mut RewriteOutcome) {
    match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                rewrite_table_with_joins(table, rules, cte_names, outcome);
            }
            if let Some(selection) = select.selection.as_mut() {
                rewrite_expr(selection, rules, cte_names, outcome);
            }
            if let Some(having) = select.having.as_mut() {
                rewrite_expr(having, rules, cte_names, outcome);
            }
        }
        SetExpr::Query(query) => rewrite_query(query, rules, cte_names, outcome),
        SetExpr::SetOperation { left, right, .. } => {
            rewrite_set_expr(left, rules, cte_names, outcome);
            rewrite_set_expr(right, rules, cte_names, outcome);
        }
        _ => {}
    }
}

fn rewrite_table_with_joins(
    table: &mut TableWithJoins,
    rules: &[RewriteRule],
    cte_names: &BTreeSet<String>,
    outcome: &mut RewriteOutcome,
) {
    rewrite_table_factor(&mut table.relation, rules, cte_names, outcome);
    for join in &mut table.joins {
        rewrite_table_factor(&mut join.relation, rules, cte_names, outcome);
    }
}

fn rewrite_table_factor(
    factor: &mut TableFactor,
    rules: &[RewriteRule],
    cte_names: &BTreeSet<String>,
    outcome: &mut RewriteOutcome,
) {
    match factor {
        TableFactor::Table { name, .. } => {
            let original = table_ref_from(name);
            if original.schema.is_none() && cte_names.contains(&original.name.to_lowercase()) {
                return;
            }
            if apply_rules(name, rules) {
                outcome.rewritten.push(original);
            } else {
                outcome.unchanged.push(original);
            }
        }
        TableFactor::Derived { subquery, .. } => rewrite_query(subquery, rules, cte_names, outcome),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => rewrite_table_with_joins(table_with_joins, rules, cte_names, outcome),
        _ => {}
    }
}

fn rewrite_expr(expr: &mut Expr, rules: &[RewriteRule], cte_names: &BTreeSet<String>, outcome: &mut RewriteOutcome) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            rewrite_expr(left, rules, cte_names, outcome);
            rewrite_expr(right, rules, cte_names, outcome);
        }
        Expr::UnaryOp { expr, .. } => rewrite_expr(expr, rules, cte_names, outcome),
        Expr::Nested(inner) => rewrite_expr(inner, rules, cte_names, outcome),
        Expr::InSubquery { subquery, expr, .. } => {
            rewrite_expr(expr, rules, cte_names, outcome);
            rewrite_query(subquery, rules, cte_names, outcome);
        }
        Expr::Exists { subquery, .. } => rewrite_query(subquery, rules, cte_names, outcome),
        Expr::Subquery(subquery) => rewrite_query(subquery, rules, cte_names, outcome),
        _ => {}
    }
}

/// Apply the first matching rule to a table name. Returns true when the name
/// was mutated.
fn apply_rules(name: &mut ObjectName, rules: &[RewriteRule]) -> bool {
    let current = table_ref_from(name);
    let current_catalog = current.catalog.as_deref().unwrap_or("").to_lowercase();
    let current_schema = current.schema.as_deref().unwrap_or("").to_lowercase();

    for rule in rules {
        let matched = if !current_catalog.is_empty() && !current_schema.is_empty() {
            match (&rule.source_catalog, &rule.source_schema) {
                (Some(catalog), Some(schema)) => {
                    catalog.to_lowercase() == current_catalog
                        && schema.to_lowercase() == current_schema
                }
                _ => false,
            }
        } else if !current_schema.is_empty() {
            matches!(&rule.source_schema, Some(schema) if schema.to_lowercase() == current_schema)
        } else if !current_catalog.is_empty() {
            matches!(&rule.source_catalog, Some(catalog) if catalog.to_lowercase() == current_catalog)
        } else {
            // Unqualified tables are only captured by rules that name no
            // source qualifier at all.
            rule.source_catalog.is_none()
                && rule.source_schema.is_none()
                && (rule.target_catalog.is_some() || rule.target_schema.is_some())
        };

        if matched {
            let new_catalog = rule
                .target_catalog
                .clone()
                .or(current.catalog.clone());
            let new_schema = rule.target_schema.clone().or(current.schema.clone());

            let mut parts: Vec<ObjectNamePart> = Vec::with_capacity(3);
            // A catalog without a schema is unrepresentable in a dotted name.
            if let (Some(catalog), Some(_)) = (&new_catalog, &new_schema) {
                parts.push(ObjectNamePart::Identifier(Ident::new(catalog.clone())));
            }
            if let Some(schema) = &new_schema {
                parts.push(ObjectNamePart::Identifier(Ident::new(schema.clone())));
            }
            parts.push(ObjectNamePart::Identifier(Ident::new(current.name.clone())));
            *name = ObjectName(parts);
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::backend::SqlRewrite;

    fn schema_rule(from: &str, to: &str) -> RewriteRule {
        RewriteRule {
            source_schema: Some(from.to_string()),
            target_schema: Some(to.to_string()),
            ..RewriteRule::default()
        }
    }

    #[test]
    fn test_schema_qualified_rewrite() {
        let engine = ParserEngine::new();
        let result = engine.rewrite_tables(
            "SELECT * FROM staging.orders o JOIN staging.users u ON o.user_id = u.id",
            &[schema_rule("staging", "prod")],
            Dialect::Databricks,
        );
        assert!(result.rewritten_sql.contains("prod.orders"));
        assert!(result.rewritten_sql.contains("prod.users"));
        assert_eq!(result.tables_rewritten.len(), 2);
        assert!(result.tables_unchanged.is_empty());
    }

    #[test]
    fn test_non_matching_tables_are_unchanged() {
        let engine = ParserEngine::new();
        let result = engine.rewrite_tables(
            "SELECT * FROM raw.events",
            &[schema_rule("staging", "prod")],
            Dialect::Databricks,
        );
        assert_eq!(result.rewritten_sql, "SELECT * FROM raw.events");
        assert_eq!(result.tables_unchanged.len(), 1);
        assert!(result.tables_rewritten.is_empty());
    }

    #[test]
    fn test_unqualified_table_gains_target_schema() {
        let engine = ParserEngine::new();
        let rule = RewriteRule {
            target_schema: Some("sandbox".to_string()),
            ..RewriteRule::default()
        };
        let result =
            engine.rewrite_tables("SELECT * FROM events", &[rule], Dialect::Databricks);
        assert_eq!(result.rewritten_sql, "SELECT * FROM sandbox.events");
    }

    #[test]
    fn test_cte_bodies_and_subqueries_are_rewritten() {
        let engine = ParserEngine::new();
        let result = engine.rewrite_tables(
            "WITH c AS (SELECT id FROM staging.orders) \
             SELECT * FROM c WHERE id IN (SELECT id FROM staging.refunds)",
            &[schema_rule("staging", "prod")],
            Dialect::Databricks,
        );
        assert!(result.rewritten_sql.contains("prod.orders"));
        assert!(result.rewritten_sql.contains("prod.refunds"));
    }

    #[test]
    fn test_quote_identifier_per_dialect() {
        let engine = ParserEngine::new();
        assert_eq!(
            engine.quote_identifier("order", Dialect::Databricks),
            "`order`"
        );
        assert_eq!(engine.quote_identifier("order", Dialect::DuckDb), "\"order\"");
    }
}
