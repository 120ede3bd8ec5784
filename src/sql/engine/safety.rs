//! AST-based detection of destructive SQL operations.
//!
//! Detection never inspects the raw SQL text of parseable statements —
//! obfuscated spacing, casing, or comments cannot hide an operation from the
//! AST. Statements the parser models only loosely are classified by their
//! leading keywords after regeneration, the analogue of a parser escape
//! hatch. SQL that cannot be parsed at all is reported as a single
//! error-severity violation rather than silently passed.

use sqlparser::ast::{AlterTableOperation, ObjectType, Statement, TableObject};

use crate::sql::backend::SqlSafety;
use crate::sql::engine::{parse_statements, ParserEngine};
use crate::sql::types::{
    Dialect, SafetyCheckResult, SafetyOptions, SafetyViolation, SafetyViolationKind,
    ViolationSeverity,
};

impl SqlSafety for ParserEngine {
    fn check(&self, sql: &str, dialect: Dialect, options: SafetyOptions) -> SafetyCheckResult {
        let statements = match parse_statements(sql, dialect) {
            Ok(statements) => statements,
            Err(err) => {
                tracing::warn!("safety guard could not parse input: {err}");
                return SafetyCheckResult {
                    is_safe: false,
                    violations: vec![SafetyViolation {
                        kind: SafetyViolationKind::Unparseable,
                        target: String::new(),
                        detail: format!("SQL could not be parsed for safety analysis: {err}"),
                        severity: ViolationSeverity::Error,
                    }],
                    checked_statements: 0,
                };
            }
        };

        let mut violations = Vec::new();
        let mut checked = 0;
        for statement in &statements {
            checked += 1;
            check_statement(statement, options, &mut violations);
        }

        SafetyCheckResult {
            is_safe: violations.is_empty(),
            violations,
            checked_statements: checked,
        }
    }
}

fn error(kind: SafetyViolationKind, target: impl Into<String>, detail: String) -> SafetyViolation {
    SafetyViolation {
        kind,
        target: target.into(),
        detail,
        severity: ViolationSeverity::Error,
    }
}

fn warning(kind: SafetyViolationKind, target: impl Into<String>, detail: String) -> SafetyViolation {
    SafetyViolation {
        kind,
        target: target.into(),
        detail,
        severity: ViolationSeverity::Warning,
    }
}

fn check_statement(
    statement: &Statement,
    options: SafetyOptions,
    violations: &mut Vec<SafetyViolation>,
) {
    match statement {
        Statement::Drop {
            object_type, names, ..
        } => {
            let kind = match object_type {
                ObjectType::Table => Some(SafetyViolationKind::DropTable),
                ObjectType::View => Some(SafetyViolationKind::DropView),
                ObjectType::Schema | ObjectType::Database => Some(SafetyViolationKind::DropSchema),
                _ => None,
            };
            if let Some(kind) = kind {
                let target = names
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                violations.push(error(
                    kind,
                    target.clone(),
                    format!("DROP {object_type} detected on `{target}`"),
                ));
            }
        }

        Statement::Truncate { table_names, .. } => {
            let target = table_names
                .iter()
                .map(|t| t.name.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            violations.push(error(
                SafetyViolationKind::Truncate,
                target.clone(),
                format!("TRUNCATE TABLE detected on `{target}`"),
            ));
        }

        Statement::Delete(delete) => {
            if delete.selection.is_none() {
                use sqlparser::ast::FromTable;
                let from = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
                };
                let target = from
                    .first()
                    .map(|t| t.relation.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                violations.push(error(
                    SafetyViolationKind::DeleteWithoutWhere,
                    target.clone(),
                    format!("DELETE without WHERE clause on `{target}` would remove all rows"),
                ));
            }
        }

        Statement::AlterTable {
            name, operations, ..
        } => {
            for operation in operations {
                if matches!(operation, AlterTableOperation::DropColumn { .. }) {
                    violations.push(error(
                        SafetyViolationKind::AlterDropColumn,
                        name.to_string(),
                        "ALTER TABLE ... DROP COLUMN detected".to_string(),
                    ));
                }
            }
        }

        Statement::Grant { .. } => {
            violations.push(error(
                SafetyViolationKind::Grant,
                String::new(),
                "GRANT statement detected".to_string(),
            ));
        }

        Statement::Revoke { .. } => {
            violations.push(error(
                SafetyViolationKind::Revoke,
                String::new(),
                "REVOKE statement detected".to_string(),
            ));
        }

        Statement::Insert(insert) => {
            let target = match &insert.table {
                TableObject::TableName(name) => name.to_string(),
                _ => "unknown".to_string(),
            };
            if insert.overwrite && insert.partitioned.is_none() {
                violations.push(warning(
                    SafetyViolationKind::InsertOverwriteAll,
                    target.clone(),
                    format!(
                        "INSERT OVERWRITE without PARTITION clause on `{target}` replaces the entire table"
                    ),
                ));
            } else if !options.allow_insert && !insert.overwrite {
                violations.push(warning(
                    SafetyViolationKind::Insert,
                    target.clone(),
                    format!("INSERT INTO detected on `{target}`"),
                ));
            }
        }

        Statement::CreateTable(create) => {
            if !options.allow_create {
                violations.push(warning(
                    SafetyViolationKind::CreateObject,
                    create.name.to_string(),
                    format!("CREATE TABLE detected on `{}`", create.name),
                ));
            }
        }

        Statement::CreateView { name, .. } => {
            if !options.allow_create {
                violations.push(warning(
                    SafetyViolationKind::CreateObject,
                    name.to_string(),
                    format!("CREATE VIEW detected on `{name}`"),
                ));
            }
        }

        Statement::CreateSchema { schema_name, .. } => {
            if !options.allow_create {
                violations.push(warning(
                    SafetyViolationKind::CreateObject,
                    schema_name.to_string(),
                    format!("CREATE SCHEMA detected on `{schema_name}`"),
                ));
            }
        }

        Statement::CreateDatabase { db_name, .. } => {
            if !options.allow_create {
                violations.push(warning(
                    SafetyViolationKind::CreateObject,
                    db_name.to_string(),
                    format!("CREATE DATABASE detected on `{db_name}`"),
                ));
            }
        }

        Statement::Explain { statement, .. } => {
            check_statement(statement, options, violations);
        }

        other => check_fallback(other, violations),
    }
}

/// Keyword inspection for statement shapes the parser does not model
/// structurally. Operates on the regenerated statement text, so comments and
/// irregular spacing are already gone.
fn check_fallback(statement: &Statement, violations: &mut Vec<SafetyViolation>) {
    let text = statement.to_string();
    let upper = text.trim_start().to_uppercase();

    if upper.starts_with("EXEC ") || upper.starts_with("EXECUTE ") || upper == "EXEC" {
        violations.push(error(
            SafetyViolationKind::RawExec,
            String::new(),
            format!("Raw EXEC/EXECUTE detected: `{}`", truncate(&text, 80)),
        ));
    } else if upper.starts_with("CREATE USER") {
        violations.push(error(
            SafetyViolationKind::CreateUser,
            String::new(),
            "CREATE USER detected".to_string(),
        ));
    } else if upper.starts_with("TRUNCATE") {
        violations.push(error(
            SafetyViolationKind::Truncate,
            String::new(),
            format!("TRUNCATE detected via fallback: `{}`", truncate(&text, 80)),
        ));
    } else if upper.starts_with("GRANT") {
        violations.push(error(
            SafetyViolationKind::Grant,
            String::new(),
            "GRANT statement detected".to_string(),
        ));
    } else if upper.starts_with("REVOKE") {
        violations.push(error(
            SafetyViolationKind::Revoke,
            String::new(),
            "REVOKE statement detected".to_string(),
        ));
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::backend::SqlSafety;

    fn check(sql: &str) -> SafetyCheckResult {
        ParserEngine::new().check(sql, Dialect::Databricks, SafetyOptions::default())
    }

    #[test]
    fn test_plain_select_is_safe() {
        let result = check("SELECT a, b FROM t WHERE a > 1");
        assert!(result.is_safe);
        assert_eq!(result.checked_statements, 1);
    }

    #[test]
    fn test_drop_table_is_error() {
        let result = check("DROP TABLE analytics.orders");
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::DropTable);
        assert_eq!(result.violations[0].severity, ViolationSeverity::Error);
        assert!(result.violations[0].target.contains("analytics.orders"));
    }

    #[test]
    fn test_truncate_is_error() {
        let result = check("TRUNCATE TABLE analytics.orders");
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::Truncate);
    }

    #[test]
    fn test_delete_without_where_is_error() {
        let result = check("DELETE FROM t");
        assert!(!result.is_safe);
        assert_eq!(
            result.violations[0].kind,
            SafetyViolationKind::DeleteWithoutWhere
        );
    }

    #[test]
    fn test_delete_with_where_is_safe() {
        let result = check("DELETE FROM t WHERE id = 1");
        assert!(result.is_safe);
    }

    #[test]
    fn test_alter_drop_column_is_error() {
        let result = check("ALTER TABLE t DROP COLUMN legacy_flag");
        assert!(!result.is_safe);
        assert_eq!(
            result.violations[0].kind,
            SafetyViolationKind::AlterDropColumn
        );
    }

    #[test]
    fn test_grant_is_error() {
        let result = check("GRANT SELECT ON t TO analyst");
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::Grant);
    }

    #[test]
    fn test_plain_insert_is_warning_by_default() {
        let result = check("INSERT INTO t (a) VALUES (1)");
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::Insert);
        assert_eq!(result.violations[0].severity, ViolationSeverity::Warning);
        assert!(!result.has_blocking_violation());
    }

    #[test]
    fn test_insert_allowed_when_opted_in() {
        let result = ParserEngine::new().check(
            "INSERT INTO t (a) VALUES (1)",
            Dialect::Databricks,
            SafetyOptions {
                allow_insert: true,
                ..SafetyOptions::default()
            },
        );
        assert!(result.is_safe);
    }

    #[test]
    fn test_unparseable_sql_is_flagged() {
        let result = check("DR0P TBLE oops");
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::Unparseable);
        assert_eq!(result.checked_statements, 0);
    }

    #[test]
    fn test_multi_statement_checks_each() {
        let result = check("SELECT 1; DROP TABLE t");
        assert_eq!(result.checked_statements, 2);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, SafetyViolationKind::DropTable);
    }
}
