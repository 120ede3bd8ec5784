//! Scope-aware table and column extraction.
//!
//! Table extraction excludes CTE names from the result so that only external
//! tables surface as dependencies; subquery-referenced tables are included.

use std::collections::BTreeSet;

use sqlparser::ast::{Expr, Query, Select, SelectItem, TableFactor};

use crate::sql::backend::SqlScope;
use crate::sql::engine::walk::{
    collect_cte_names, collect_tables, first_select, statement_query, AstWalker,
};
use crate::sql::engine::{parse_single, ParserEngine};
use crate::sql::types::{ColumnExtraction, ColumnRef, Dialect, ScopeResult, SqlToolkitError};

/// Function names treated as aggregations when no window clause is attached.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "SUM",
    "COUNT",
    "AVG",
    "MIN",
    "MAX",
    "STDDEV",
    "STDDEV_POP",
    "STDDEV_SAMP",
    "VARIANCE",
    "VAR_POP",
    "VAR_SAMP",
    "ARRAY_AGG",
    "GROUP_CONCAT",
    "STRING_AGG",
    "LISTAGG",
    "APPROX_COUNT_DISTINCT",
    "COUNT_IF",
    "PERCENTILE",
    "PERCENTILE_CONT",
    "PERCENTILE_DISC",
];

pub(crate) fn is_aggregate_function(name: &str) -> bool {
    let upper = name.to_uppercase();
    AGGREGATE_FUNCTIONS.contains(&upper.as_str())
}

impl SqlScope for ParserEngine {
    fn extract_tables(&self, sql: &str, dialect: Dialect) -> Result<ScopeResult, SqlToolkitError> {
        let statement = parse_single(sql, dialect)?;

        let cte_names = collect_cte_names(&statement);
        let mut tables = BTreeSet::new();
        for table in collect_tables(&statement) {
            if table.name.is_empty() {
                continue;
            }
            // A bare reference to a CTE is scope-local, not a dependency.
            if table.schema.is_none() && cte_names.contains(&table.name.to_lowercase()) {
                continue;
            }
            tables.insert(table);
        }

        let mut referenced_tables: Vec<_> = tables.into_iter().collect();
        referenced_tables.sort_by_key(|t| t.fully_qualified());

        Ok(ScopeResult {
            referenced_tables,
            cte_names: cte_names.into_iter().collect(),
        })
    }

    fn extract_columns(
        &self,
        sql: &str,
        dialect: Dialect,
    ) -> Result<ColumnExtraction, SqlToolkitError> {
        let statement = parse_single(sql, dialect)?;

        let mut output_columns = Vec::new();
        if let Some(select) = statement_query(&statement).and_then(first_select) {
            output_columns = output_columns_of(select);
            output_columns.sort();
        }

        let mut referenced = BTreeSet::new();
        let mut has_star = false;
        let mut has_aggregation = false;
        let mut has_window_functions = false;

        let mut on_expr = |expr: &Expr| match expr {
            Expr::Identifier(ident) => {
                referenced.insert(ColumnRef {
                    table: None,
                    name: ident.value.clone(),
                });
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                referenced.insert(ColumnRef {
                    table: Some(parts[parts.len() - 2].value.clone()),
                    name: parts[parts.len() - 1].value.clone(),
                });
            }
            Expr::Function(function) => {
                let name = function
                    .name
                    .0
                    .last()
                    .map(super::walk::part_value)
                    .unwrap_or_default();
                if is_aggregate_function(&name) {
                    has_aggregation = true;
                }
                if function.over.is_some() {
                    has_window_functions = true;
                }
            }
            _ => {}
        };
        let mut on_select = |select: &Select| {
            for item in &select.projection {
                if matches!(
                    item,
                    SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
                ) {
                    has_star = true;
                }
            }
        };
        let mut noop_query = |_: &Query| {};
        let mut noop_table = |_: &TableFactor| {};
        AstWalker {
            on_query: &mut noop_query,
            on_select: &mut on_select,
            on_table: &mut noop_table,
            on_expr: &mut on_expr,
        }
        .statement(&statement);

        Ok(ColumnExtraction {
            output_columns,
            referenced_columns: referenced.into_iter().collect(),
            has_star,
            has_aggregation,
            has_window_functions,
        })
    }
}

/// Output column names of a SELECT, in projection order.
pub(crate) fn output_columns_of(select: &Select) -> Vec<String> {
    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::ExprWithAlias { alias, .. } => columns.push(alias.value.clone()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => columns.push(ident.value.clone()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                if let Some(last) = parts.last() {
                    columns.push(last.value.clone());
                }
            }
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                columns.push("*".to_string());
            }
            SelectItem::UnnamedExpr(expr) => columns.push(expr.to_string()),
        }
    }
    columns
}
