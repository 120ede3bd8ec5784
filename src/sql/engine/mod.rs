//! sqlparser-backed implementation of the SQL toolkit.
//!
//! The only module in the crate that names the parsing library. Each
//! capability lives in its own file; this module owns the engine struct,
//! dialect mapping, and the parse / render / transpile capabilities.

mod diff;
mod lineage;
mod normalize;
mod rewrite;
mod safety;
mod scope;
mod walk;

use std::sync::Arc;

use sqlparser::ast::Statement;
use sqlparser::dialect::{
    DatabricksDialect, Dialect as ParserDialect, DuckDbDialect, RedshiftSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;

use crate::sql::backend::{RenderOptions, SqlBackend, SqlParse, SqlRender, SqlTranspile};
use crate::sql::types::{
    Dialect, ParseResult, SqlStatement, SqlToolkitError, StatementKind, TranspileResult,
};

/// The default SQL backend, built on a third-party parser.
#[derive(Debug, Default)]
pub struct ParserEngine;

impl ParserEngine {
    pub fn new() -> Self {
        Self
    }
}

impl SqlBackend for ParserEngine {}

fn parser_dialect(dialect: Dialect) -> Box<dyn ParserDialect> {
    match dialect {
        Dialect::Databricks => Box::new(DatabricksDialect {}),
        Dialect::DuckDb => Box::new(DuckDbDialect {}),
        Dialect::Redshift => Box::new(RedshiftSqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Parse a SQL script into raw statements.
pub(crate) fn parse_statements(
    sql: &str,
    dialect: Dialect,
) -> Result<Vec<Statement>, SqlToolkitError> {
    Parser::parse_sql(&*parser_dialect(dialect), sql)
        .map_err(|e| SqlToolkitError::Parse(e.to_string()))
}

/// Parse a script and return its first statement, rejecting empty input.
pub(crate) fn parse_single(sql: &str, dialect: Dialect) -> Result<Statement, SqlToolkitError> {
    let mut statements = parse_statements(sql, dialect)?;
    if statements.is_empty() {
        return Err(SqlToolkitError::Parse("empty SQL input".to_string()));
    }
    Ok(statements.remove(0))
}

fn classify(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert(_) => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete(_) => StatementKind::Delete,
        Statement::Drop { .. } => StatementKind::Drop,
        Statement::Truncate { .. } => StatementKind::Truncate,
        Statement::AlterTable { .. } => StatementKind::Alter,
        Statement::Merge { .. } => StatementKind::Merge,
        Statement::Grant { .. } => StatementKind::Grant,
        Statement::Revoke { .. } => StatementKind::Revoke,
        Statement::CreateTable(_)
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. } => StatementKind::Create,
        _ => StatementKind::Other,
    }
}

/// Wrap a raw statement into the implementation-agnostic carrier.
pub(crate) fn wrap(statement: Statement, dialect: Dialect) -> SqlStatement {
    let kind = classify(&statement);
    let sql_text = statement.to_string();
    SqlStatement::new(kind, dialect, sql_text, Arc::new(statement))
}

/// Recover the raw statement from a wrapper produced by this engine.
pub(crate) fn unwrap(statement: &SqlStatement) -> Result<&Statement, SqlToolkitError> {
    statement.raw().downcast_ref::<Statement>().ok_or_else(|| {
        SqlToolkitError::Parse("statement was not produced by this backend".to_string())
    })
}

impl SqlParse for ParserEngine {
    fn parse_one(
        &self,
        sql: &str,
        dialect: Dialect,
        raise_on_error: bool,
    ) -> Result<ParseResult, SqlToolkitError> {
        match parse_statements(sql, dialect) {
            Ok(statements) => {
                if statements.len() > 1 {
                    return Err(SqlToolkitError::Parse(format!(
                        "Expected exactly 1 statement, got {}",
                        statements.len()
                    )));
                }
                Ok(ParseResult {
                    statements: statements.into_iter().map(|s| wrap(s, dialect)).collect(),
                    dialect,
                    warnings: Vec::new(),
                })
            }
            Err(err) if raise_on_error => Err(err),
            Err(err) => Ok(ParseResult {
                statements: Vec::new(),
                dialect,
                warnings: vec![err.to_string()],
            }),
        }
    }

    fn parse_multi(&self, sql: &str, dialect: Dialect) -> Result<ParseResult, SqlToolkitError> {
        let statements = parse_statements(sql, dialect)?;
        Ok(ParseResult {
            statements: statements.into_iter().map(|s| wrap(s, dialect)).collect(),
            dialect,
            warnings: Vec::new(),
        })
    }
}

impl SqlRender for ParserEngine {
    fn render(
        &self,
        statement: &SqlStatement,
        _dialect: Dialect,
        options: RenderOptions,
    ) -> Result<String, SqlToolkitError> {
        let raw = unwrap(statement)?;
        if options.pretty {
            Ok(format!("{raw:#}"))
        } else {
            Ok(raw.to_string())
        }
    }
}

impl SqlTranspile for ParserEngine {
    fn transpile(
        &self,
        sql: &str,
        source_dialect: Dialect,
        target_dialect: Dialect,
    ) -> Result<TranspileResult, SqlToolkitError> {
        match parse_statements(sql, source_dialect) {
            Ok(statements) if !statements.is_empty() => {
                let output_sql = statements
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Ok(TranspileResult {
                    output_sql,
                    source_dialect,
                    target_dialect,
                    warnings: Vec::new(),
                    fallback_used: false,
                })
            }
            Ok(_) => Ok(TranspileResult {
                output_sql: sql.to_string(),
                source_dialect,
                target_dialect,
                warnings: vec!["input contained no statements".to_string()],
                fallback_used: true,
            }),
            Err(err) => {
                tracing::warn!(
                    "transpile fell back to original SQL ({source_dialect} -> {target_dialect}): {err}"
                );
                Ok(TranspileResult {
                    output_sql: sql.to_string(),
                    source_dialect,
                    target_dialect,
                    warnings: vec![err.to_string()],
                    fallback_used: true,
                })
            }
        }
    }
}
