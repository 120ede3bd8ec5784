//! Column-level lineage.
//!
//! Traces each output column of a statement back through CTEs, joins,
//! subqueries, and expressions to the ultimate source columns, classifying
//! the transformation applied at each resolution. The guiding rule is:
//! when in doubt, mark the column unresolved — lineage is never fabricated.

use std::collections::BTreeMap;

use sqlparser::ast::{Expr, Query, Select, SelectItem, TableFactor};

use crate::sql::backend::SqlLineage;
use crate::sql::engine::scope::is_aggregate_function;
use crate::sql::engine::walk::{first_select, part_value, statement_query, table_ref_from};
use crate::sql::engine::{parse_single, ParserEngine};
use crate::sql::types::{
    ColumnLineage, Dialect, LineageNode, SchemaMap, SqlToolkitError, TableRef, TransformKind,
};

/// Recursion guard for pathological CTE nesting.
const MAX_DEPTH: usize = 16;

/// Unnamed output expressions are identified by their SQL text, capped.
const MAX_EXPR_LABEL: usize = 64;

impl SqlLineage for ParserEngine {
    fn column_lineage(
        &self,
        sql: &str,
        dialect: Dialect,
        schema: Option<&SchemaMap>,
    ) -> Result<ColumnLineage, SqlToolkitError> {
        let statement = parse_single(sql, dialect)?;
        let query = statement_query(&statement).ok_or_else(|| {
            SqlToolkitError::Lineage("statement has no query to trace".to_string())
        })?;
        let select = first_select(query).ok_or_else(|| {
            SqlToolkitError::Lineage("query has no SELECT to trace".to_string())
        })?;

        let cte_env = collect_cte_env(query);
        let sources = collect_sources(select, &cte_env);

        let mut outputs = output_labels(select);

        // SELECT * expansion: with a schema we can substitute the star with
        // the concrete column list of the (single) external source. Without
        // one, the star stays unresolved.
        let mut star_expansion: Vec<(String, TableRef)> = Vec::new();
        if outputs.iter().any(|label| label == "*") {
            if let Some(schema) = schema {
                star_expansion = expand_star(&sources, schema);
            }
            if !star_expansion.is_empty() {
                outputs.retain(|label| label != "*");
                for (column, _) in &star_expansion {
                    outputs.push(column.clone());
                }
            }
        }

        let mut column_lineage = BTreeMap::new();
        let mut unresolved = Vec::new();

        for output in &outputs {
            if output == "*" {
                unresolved.push(output.clone());
                continue;
            }

            if let Some((_, table)) = star_expansion.iter().find(|(column, _)| column == output) {
                column_lineage.insert(
                    output.clone(),
                    vec![LineageNode {
                        column: output.clone(),
                        source_table: Some(table.fully_qualified()),
                        source_column: Some(output.clone()),
                        transform: TransformKind::Direct,
                        transform_sql: String::new(),
                    }],
                );
                continue;
            }

            match trace_column(select, &sources, &cte_env, schema, output, 0) {
                Ok(mut nodes) => {
                    for node in &mut nodes {
                        node.column = output.clone();
                    }
                    column_lineage.insert(output.clone(), nodes);
                }
                Err(reason) => {
                    tracing::debug!("column lineage unresolved for '{output}': {reason}");
                    unresolved.push(output.clone());
                }
            }
        }

        unresolved.sort();
        unresolved.dedup();

        Ok(ColumnLineage {
            column_lineage,
            unresolved_columns: unresolved,
            dialect,
        })
    }
}

/// Where a FROM-clause name resolves to.
#[derive(Clone)]
enum Source<'a> {
    External(TableRef),
    Scoped(&'a Query),
}

/// CTE name (lowercased) → definition query, from the top-level WITH clause.
fn collect_cte_env(query: &Query) -> BTreeMap<String, &Query> {
    let mut env = BTreeMap::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            env.insert(cte.alias.name.value.to_lowercase(), cte.query.as_ref());
        }
    }
    env
}

/// Alias (or bare table name, lowercased) → source, for every FROM relation
/// and join in the select.
fn collect_sources<'a>(
    select: &'a Select,
    cte_env: &BTreeMap<String, &'a Query>,
) -> BTreeMap<String, Source<'a>> {
    let mut sources = BTreeMap::new();
    let mut add_factor = |factor: &'a TableFactor| match factor {
        TableFactor::Table { name, alias, .. } => {
            let table = table_ref_from(name);
            let key = alias
                .as_ref()
                .map(|a| a.name.value.to_lowercase())
                .unwrap_or_else(|| table.name.to_lowercase());
            let source = if table.schema.is_none() {
                match cte_env.get(&table.name.to_lowercase()) {
                    Some(query) => Source::Scoped(query),
                    None => Source::External(table),
                }
            } else {
                Source::External(table)
            };
            sources.insert(key, source);
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            if let Some(alias) = alias {
                sources.insert(alias.name.value.to_lowercase(), Source::Scoped(subquery));
            }
        }
        _ => {}
    };
    for table in &select.from {
        add_factor(&table.relation);
        for join in &table.joins {
            add_factor(&join.relation);
        }
    }
    sources
}

/// Output labels of a select, in projection order.
fn output_labels(select: &Select) -> Vec<String> {
    let mut labels = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::ExprWithAlias { alias, .. } => labels.push(alias.value.clone()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => labels.push(ident.value.clone()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                if let Some(last) = parts.last() {
                    labels.push(last.value.clone());
                }
            }
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                labels.push("*".to_string());
            }
            SelectItem::UnnamedExpr(expr) => {
                let text = expr.to_string();
                labels.push(text.chars().take(MAX_EXPR_LABEL).collect());
            }
        }
    }
    labels
}

/// Expand `*` when every FROM source is an external table with known schema.
/// Any unknown source aborts the expansion — a partial star would fabricate
/// lineage.
fn expand_star(sources: &BTreeMap<String, Source<'_>>, schema: &SchemaMap) -> Vec<(String, TableRef)> {
    let mut expansion = Vec::new();
    for source in sources.values() {
        match source {
            Source::External(table) => {
                let columns = schema
                    .get(&table.fully_qualified())
                    .or_else(|| schema.get(&table.name));
                match columns {
                    Some(columns) => {
                        for column in columns {
                            expansion.push((column.clone(), table.clone()));
                        }
                    }
                    None => return Vec::new(),
                }
            }
            Source::Scoped(_) => return Vec::new(),
        }
    }
    expansion
}

/// Trace one output column of a select to its leaf sources.
fn trace_column<'a>(
    select: &'a Select,
    sources: &BTreeMap<String, Source<'a>>,
    cte_env: &BTreeMap<String, &'a Query>,
    schema: Option<&SchemaMap>,
    column: &str,
    depth: usize,
) -> Result<Vec<LineageNode>, String> {
    if depth > MAX_DEPTH {
        return Err("maximum trace depth exceeded".to_string());
    }

    let Some((expr, expr_sql)) = find_projection(select, column) else {
        // The column may flow through a bare `SELECT *` of a single scoped
        // source.
        if has_wildcard(select) && sources.len() == 1 {
            let source = sources.values().next().expect("single source");
            return resolve_through_source(
                source, cte_env, schema, column, "", TransformKind::Direct, depth,
            );
        }
        return Err(format!("no projection found for column '{column}'"));
    };

    let transform = classify_transform(&expr);
    let refs = column_refs_in(&expr);

    if refs.is_empty() {
        return Ok(vec![LineageNode {
            column: column.to_string(),
            source_table: None,
            source_column: None,
            transform: TransformKind::Literal,
            transform_sql: expr_sql,
        }]);
    }

    let mut nodes = Vec::new();
    for (qualifier, name) in refs {
        let source = match &qualifier {
            Some(qualifier) => sources
                .get(&qualifier.to_lowercase())
                .ok_or_else(|| format!("unknown qualifier '{qualifier}'"))?,
            None => resolve_unqualified(sources, schema, &name)?,
        };
        let resolved = resolve_through_source(
            source,
            cte_env,
            schema,
            &name,
            &expr_sql,
            transform,
            depth,
        )?;
        nodes.extend(resolved);
    }
    Ok(nodes)
}

/// Resolve a column against one FROM source, recursing into scoped queries.
fn resolve_through_source<'a>(
    source: &Source<'a>,
    cte_env: &BTreeMap<String, &'a Query>,
    schema: Option<&SchemaMap>,
    column: &str,
    expr_sql: &str,
    transform: TransformKind,
    depth: usize,
) -> Result<Vec<LineageNode>, String> {
    match source {
        Source::External(table) => Ok(vec![LineageNode {
            column: column.to_string(),
            source_table: Some(table.fully_qualified()),
            source_column: Some(column.to_string()),
            transform,
            transform_sql: if transform == TransformKind::Direct {
                String::new()
            } else {
                expr_sql.to_string()
            },
        }]),
        Source::Scoped(query) => {
            let select = first_select(query)
                .ok_or_else(|| "scoped source has no SELECT".to_string())?;
            let inner_env = merged_env(cte_env, query);
            let inner_sources = collect_sources(select, &inner_env);
            let inner = trace_column(select, &inner_sources, &inner_env, schema, column, depth + 1)?;
            Ok(inner
                .into_iter()
                .map(|node| LineageNode {
                    transform: merge_transform(transform, node.transform),
                    transform_sql: if node.transform_sql.is_empty() {
                        expr_sql.to_string()
                    } else {
                        node.transform_sql
                    },
                    ..node
                })
                .collect())
        }
    }
}

/// Inner queries see their own CTEs plus the enclosing environment.
fn merged_env<'a>(
    outer: &BTreeMap<String, &'a Query>,
    query: &'a Query,
) -> BTreeMap<String, &'a Query> {
    let mut env = outer.clone();
    env.extend(collect_cte_env(query));
    env
}

/// An unqualified column resolves to the only source, or to the unique
/// external table whose schema contains it.
fn resolve_unqualified<'s, 'a>(
    sources: &'s BTreeMap<String, Source<'a>>,
    schema: Option<&SchemaMap>,
    column: &str,
) -> Result<&'s Source<'a>, String> {
    if sources.len() == 1 {
        return Ok(sources.values().next().expect("single source"));
    }
    if let Some(schema) = schema {
        let mut matches = sources.values().filter(|source| match source {
            Source::External(table) => schema
                .get(&table.fully_qualified())
                .or_else(|| schema.get(&table.name))
                .map(|columns| columns.iter().any(|c| c == column))
                .unwrap_or(false),
            Source::Scoped(_) => false,
        });
        if let Some(only) = matches.next() {
            if matches.next().is_none() {
                return Ok(only);
            }
        }
    }
    Err(format!(
        "ambiguous unqualified column '{column}' across {} sources",
        sources.len()
    ))
}

/// Find the projection expression for an output column label.
fn find_projection(select: &Select, column: &str) -> Option<(Expr, String)> {
    for item in &select.projection {
        let (label, expr) = match item {
            SelectItem::ExprWithAlias { alias, expr } => (alias.value.clone(), expr),
            SelectItem::UnnamedExpr(expr @ Expr::Identifier(ident)) => (ident.value.clone(), expr),
            SelectItem::UnnamedExpr(expr @ Expr::CompoundIdentifier(parts)) => {
                match parts.last() {
                    Some(last) => (last.value.clone(), expr),
                    None => continue,
                }
            }
            SelectItem::UnnamedExpr(expr) => {
                let text: String = expr.to_string().chars().take(MAX_EXPR_LABEL).collect();
                (text, expr)
            }
            _ => continue,
        };
        if label.eq_ignore_ascii_case(column) {
            return Some((expr.clone(), expr.to_string()));
        }
    }
    None
}

fn has_wildcard(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        matches!(
            item,
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
        )
    })
}

/// Collect `(qualifier, column)` pairs referenced by an expression.
fn column_refs_in(expr: &Expr) -> Vec<(Option<String>, String)> {
    let mut refs = Vec::new();
    collect_refs(expr, &mut refs);
    refs
}

fn collect_refs(expr: &Expr, refs: &mut Vec<(Option<String>, String)>) {
    match expr {
        Expr::Identifier(ident) => refs.push((None, ident.value.clone())),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => refs.push((
            Some(parts[parts.len() - 2].value.clone()),
            parts[parts.len() - 1].value.clone(),
        )),
        Expr::BinaryOp { left, right, .. } => {
            collect_refs(left, refs);
            collect_refs(right, refs);
        }
        Expr::UnaryOp { expr, .. } => collect_refs(expr, refs),
        Expr::Nested(inner) => collect_refs(inner, refs),
        Expr::Cast { expr, .. } => collect_refs(expr, refs),
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                collect_refs(operand, refs);
            }
            for when in conditions {
                collect_refs(&when.condition, refs);
                collect_refs(&when.result, refs);
            }
            if let Some(else_result) = else_result {
                collect_refs(else_result, refs);
            }
        }
        Expr::Function(function) => {
            use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Named { arg, .. } | FunctionArg::ExprNamed { arg, .. } => arg,
                        FunctionArg::Unnamed(arg) => arg,
                    };
                    if let FunctionArgExpr::Expr(expr) = arg_expr {
                        collect_refs(expr, refs);
                    }
                }
            }
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => collect_refs(inner, refs),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_refs(expr, refs);
            collect_refs(low, refs);
            collect_refs(high, refs);
        }
        Expr::InList { expr, list, .. } => {
            collect_refs(expr, refs);
            for item in list {
                collect_refs(item, refs);
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                collect_refs(item, refs);
            }
        }
        Expr::Extract { expr, .. } => collect_refs(expr, refs),
        _ => {}
    }
}

/// Classify the transformation an expression applies to its inputs.
fn classify_transform(expr: &Expr) -> TransformKind {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => TransformKind::Direct,
        Expr::Function(function) => {
            if function.over.is_some() {
                return TransformKind::Window;
            }
            let name = function.name.0.last().map(part_value).unwrap_or_default();
            if is_aggregate_function(&name) {
                TransformKind::Aggregation
            } else {
                TransformKind::Expression
            }
        }
        Expr::Case { .. } => TransformKind::Case,
        Expr::Value(_) => TransformKind::Literal,
        Expr::Nested(inner) => classify_transform(inner),
        _ => {
            if contains_window(expr) {
                TransformKind::Window
            } else if contains_aggregate(expr) {
                TransformKind::Aggregation
            } else {
                TransformKind::Expression
            }
        }
    }
}

/// Outer transforms dominate: a direct pass-through inherits the inner
/// classification.
fn merge_transform(outer: TransformKind, inner: TransformKind) -> TransformKind {
    if outer == TransformKind::Direct {
        inner
    } else {
        outer
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    visit_functions(expr, &mut |function| {
        let name = function.name.0.last().map(part_value).unwrap_or_default();
        if is_aggregate_function(&name) {
            found = true;
        }
    });
    found
}

fn contains_window(expr: &Expr) -> bool {
    let mut found = false;
    visit_functions(expr, &mut |function| {
        if function.over.is_some() {
            found = true;
        }
    });
    found
}

fn visit_functions(expr: &Expr, f: &mut dyn FnMut(&sqlparser::ast::Function)) {
    match expr {
        Expr::Function(function) => {
            f(function);
            use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Named { arg, .. } | FunctionArg::ExprNamed { arg, .. } => arg,
                        FunctionArg::Unnamed(arg) => arg,
                    };
                    if let FunctionArgExpr::Expr(expr) = arg_expr {
                        visit_functions(expr, f);
                    }
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            visit_functions(left, f);
            visit_functions(right, f);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            visit_functions(expr, f);
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                visit_functions(operand, f);
            }
            for when in conditions {
                visit_functions(&when.condition, f);
                visit_functions(&when.result, f);
            }
            if let Some(else_result) = else_result {
                visit_functions(else_result, f);
            }
        }
        _ => {}
    }
}
