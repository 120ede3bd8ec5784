//! Two-phase AST diff.
//!
//! Phase one normalizes both sides and compares the strings: equal means the
//! change is cosmetic-only (whitespace, comments, formatting) and produces
//! zero edits. Phase two decomposes each statement into labelled components
//! (CTEs, projection items, source tables, clauses) and emits a
//! deterministically sorted edit list.

use std::collections::BTreeMap;

use similar::TextDiff;
use sqlparser::ast::{Select, SelectItem, Statement};

use crate::sql::backend::SqlDiff;
use crate::sql::engine::walk::{first_select, select_item_expr, statement_query};
use crate::sql::engine::{parse_single, parse_statements, ParserEngine};
use crate::sql::types::{AstDiffResult, ColumnChange, Dialect, DiffEdit, DiffEditKind};

/// Edit lists are capped so a full rewrite does not produce an unbounded
/// report.
const MAX_EDITS: usize = 50;

impl SqlDiff for ParserEngine {
    fn diff(&self, old_sql: &str, new_sql: &str, dialect: Dialect) -> AstDiffResult {
        // Phase 1: cosmetic check on regenerated canonical text.
        let canonical_old = canonical(old_sql, dialect);
        let canonical_new = canonical(new_sql, dialect);
        if let (Some(old), Some(new)) = (&canonical_old, &canonical_new) {
            if old == new {
                return AstDiffResult {
                    edits: Vec::new(),
                    is_identical: false,
                    is_cosmetic_only: true,
                    normalized_text_diff: String::new(),
                };
            }
        }

        // Phase 2: structural comparison.
        let (old_statement, new_statement) =
            match (parse_single(old_sql, dialect), parse_single(new_sql, dialect)) {
                (Ok(old), Ok(new)) => (old, new),
                _ => {
                    tracing::warn!("parse failed during diff; defaulting to non-identical");
                    return AstDiffResult {
                        edits: Vec::new(),
                        is_identical: false,
                        is_cosmetic_only: false,
                        normalized_text_diff: String::new(),
                    };
                }
            };

        let mut edits = compute_edits(&old_statement, &new_statement);
        if edits.is_empty() {
            return AstDiffResult {
                edits,
                is_identical: true,
                is_cosmetic_only: false,
                normalized_text_diff: String::new(),
            };
        }

        edits.sort_by(|a, b| {
            (a.kind, &a.source_sql, &a.target_sql).cmp(&(b.kind, &b.source_sql, &b.target_sql))
        });
        edits.truncate(MAX_EDITS);

        let normalized_text_diff = match (&canonical_old, &canonical_new) {
            (Some(old), Some(new)) => unified_diff(old, new),
            _ => String::new(),
        };

        AstDiffResult {
            edits,
            is_identical: false,
            is_cosmetic_only: false,
            normalized_text_diff,
        }
    }

    fn column_changes(
        &self,
        old_sql: &str,
        new_sql: &str,
        dialect: Dialect,
    ) -> BTreeMap<String, ColumnChange> {
        let (old_statement, new_statement) =
            match (parse_single(old_sql, dialect), parse_single(new_sql, dialect)) {
                (Ok(old), Ok(new)) => (old, new),
                _ => return BTreeMap::new(),
            };

        let old_columns = select_columns(&old_statement);
        let new_columns = select_columns(&new_statement);

        let mut changes = BTreeMap::new();
        for name in new_columns.keys() {
            if !old_columns.contains_key(name) {
                changes.insert(name.clone(), ColumnChange::Added);
            }
        }
        for (name, old_expr) in &old_columns {
            match new_columns.get(name) {
                None => {
                    changes.insert(name.clone(), ColumnChange::Removed);
                }
                Some(new_expr) if new_expr != old_expr => {
                    changes.insert(name.clone(), ColumnChange::Modified);
                }
                Some(_) => {}
            }
        }
        changes
    }
}

fn canonical(sql: &str, dialect: Dialect) -> Option<String> {
    let statements = parse_statements(sql, dialect).ok()?;
    if statements.is_empty() {
        return None;
    }
    Some(
        statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(2)
        .to_string()
}

/// Labelled decomposition of a statement for structural comparison.
#[derive(Default)]
struct StatementParts {
    /// CTE name (lowercased) → definition SQL, with declaration position.
    ctes: BTreeMap<String, (usize, String)>,
    /// Projection label (alias or expression text) → expression SQL.
    projection: BTreeMap<String, String>,
    /// Clause label → clause SQL.
    clauses: BTreeMap<&'static str, String>,
    /// Source table texts, sorted.
    tables: Vec<String>,
    /// Whole-statement fallback when no query decomposition applies.
    opaque: Option<String>,
}

fn decompose(statement: &Statement) -> StatementParts {
    let mut parts = StatementParts::default();
    let Some(query) = statement_query(statement) else {
        parts.opaque = Some(statement.to_string());
        return parts;
    };

    if let Some(with) = &query.with {
        for (position, cte) in with.cte_tables.iter().enumerate() {
            parts.ctes.insert(
                cte.alias.name.value.to_lowercase(),
                (position, cte.query.to_string()),
            );
        }
    }

    let Some(select) = first_select(query) else {
        parts.opaque = Some(statement.to_string());
        return parts;
    };

    for (index, item) in select.projection.iter().enumerate() {
        let label = projection_label(item, index);
        let text = match select_item_expr(item) {
            Some(expr) => expr.to_string(),
            None => item.to_string(),
        };
        parts.projection.insert(label, text);
    }

    let mut tables: Vec<String> = select
        .from
        .iter()
        .flat_map(|twj| {
            std::iter::once(twj.relation.to_string())
                .chain(twj.joins.iter().map(|j| j.relation.to_string()))
        })
        .collect();
    tables.sort();
    parts.tables = tables;

    if let Some(selection) = &select.selection {
        parts.clauses.insert("where", selection.to_string());
    }
    if let sqlparser::ast::GroupByExpr::Expressions(exprs, _) = &select.group_by {
        if !exprs.is_empty() {
            let text = exprs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            parts.clauses.insert("group_by", text);
        }
    }
    if let Some(having) = &select.having {
        parts.clauses.insert("having", having.to_string());
    }

    parts
}

fn projection_label(item: &SelectItem, index: usize) -> String {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
        SelectItem::UnnamedExpr(sqlparser::ast::Expr::Identifier(ident)) => ident.value.clone(),
        SelectItem::UnnamedExpr(sqlparser::ast::Expr::CompoundIdentifier(idents)) => idents
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_else(|| format!("expr_{index}")),
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => "*".to_string(),
        SelectItem::UnnamedExpr(_) => format!("expr_{index}"),
    }
}

fn compute_edits(old: &Statement, new: &Statement) -> Vec<DiffEdit> {
    let old_parts = decompose(old);
    let new_parts = decompose(new);

    if let (Some(old_text), Some(new_text)) = (&old_parts.opaque, &new_parts.opaque) {
        if old_text == new_text {
            return Vec::new();
        }
        return vec![DiffEdit {
            kind: DiffEditKind::Update,
            source_sql: old_text.clone(),
            target_sql: new_text.clone(),
        }];
    }

    let mut edits = Vec::new();

    // CTE edits, including pure reorders reported as moves.
    for (name, (position, text)) in &new_parts.ctes {
        match old_parts.ctes.get(name) {
            None => edits.push(DiffEdit {
                kind: DiffEditKind::Insert,
                source_sql: String::new(),
                target_sql: format!("{name} AS ({text})"),
            }),
            Some((_, old_text)) if old_text != text => edits.push(DiffEdit {
                kind: DiffEditKind::Update,
                source_sql: format!("{name} AS ({old_text})"),
                target_sql: format!("{name} AS ({text})"),
            }),
            Some((old_position, _)) if old_position != position => edits.push(DiffEdit {
                kind: DiffEditKind::Move,
                source_sql: format!("{name} AS (...)"),
                target_sql: format!("{name} AS (...)"),
            }),
            Some(_) => {}
        }
    }
    for (name, (_, text)) in &old_parts.ctes {
        if !new_parts.ctes.contains_key(name) {
            edits.push(DiffEdit {
                kind: DiffEditKind::Remove,
                source_sql: format!("{name} AS ({text})"),
                target_sql: String::new(),
            });
        }
    }

    // Projection edits.
    for (label, text) in &new_parts.projection {
        match old_parts.projection.get(label) {
            None => edits.push(DiffEdit {
                kind: DiffEditKind::Insert,
                source_sql: String::new(),
                target_sql: text.clone(),
            }),
            Some(old_text) if old_text != text => edits.push(DiffEdit {
                kind: DiffEditKind::Update,
                source_sql: old_text.clone(),
                target_sql: text.clone(),
            }),
            Some(_) => {}
        }
    }
    for (label, text) in &old_parts.projection {
        if !new_parts.projection.contains_key(label) {
            edits.push(DiffEdit {
                kind: DiffEditKind::Remove,
                source_sql: text.clone(),
                target_sql: String::new(),
            });
        }
    }

    // Source-table edits.
    for table in &new_parts.tables {
        if !old_parts.tables.contains(table) {
            edits.push(DiffEdit {
                kind: DiffEditKind::Insert,
                source_sql: String::new(),
                target_sql: table.clone(),
            });
        }
    }
    for table in &old_parts.tables {
        if !new_parts.tables.contains(table) {
            edits.push(DiffEdit {
                kind: DiffEditKind::Remove,
                source_sql: table.clone(),
                target_sql: String::new(),
            });
        }
    }

    // Clause edits.
    for (label, text) in &new_parts.clauses {
        match old_parts.clauses.get(label) {
            None => edits.push(DiffEdit {
                kind: DiffEditKind::Insert,
                source_sql: String::new(),
                target_sql: format!("{label}: {text}"),
            }),
            Some(old_text) if old_text != text => edits.push(DiffEdit {
                kind: DiffEditKind::Update,
                source_sql: format!("{label}: {old_text}"),
                target_sql: format!("{label}: {text}"),
            }),
            Some(_) => {}
        }
    }
    for (label, text) in &old_parts.clauses {
        if !new_parts.clauses.contains_key(label) {
            edits.push(DiffEdit {
                kind: DiffEditKind::Remove,
                source_sql: format!("{label}: {text}"),
                target_sql: String::new(),
            });
        }
    }

    edits
}

fn select_columns(statement: &Statement) -> BTreeMap<String, String> {
    let mut columns = BTreeMap::new();
    let select: Option<&Select> = statement_query(statement).and_then(first_select);
    if let Some(select) = select {
        for (index, item) in select.projection.iter().enumerate() {
            let label = projection_label(item, index);
            let text = match select_item_expr(item) {
                Some(expr) => expr.to_string(),
                None => item.to_string(),
            };
            columns.insert(label, text);
        }
    }
    columns
}
