//! SQL toolkit capability traits.
//!
//! These define the interface contract every backing implementation must
//! satisfy. Consumer code depends on these traits, never on a concrete
//! parsing library — that boundary is a strict architectural rule.

use std::collections::BTreeMap;

use crate::sql::types::{
    AstDiffResult, ColumnChange, ColumnExtraction, ColumnLineage, Dialect, NormalizedSql,
    ParseResult, RewriteResult, RewriteRule, SafetyCheckResult, SafetyOptions, SchemaMap,
    ScopeResult, SqlStatement, SqlToolkitError, TranspileResult,
};

/// Options for rendering a statement back to SQL text.
///
/// Keyword normalization is inherent to AST rendering — regenerated SQL
/// always carries canonical keyword casing — so the only knob is layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOptions {
    /// Format with indentation and newlines when the backend supports it.
    pub pretty: bool,
}

/// Parse SQL strings into statement wrappers.
pub trait SqlParse {
    /// Parse a single SQL statement.
    ///
    /// With `raise_on_error` set, invalid SQL is a [`SqlToolkitError::Parse`];
    /// otherwise an empty result with warnings is returned.
    fn parse_one(
        &self,
        sql: &str,
        dialect: Dialect,
        raise_on_error: bool,
    ) -> Result<ParseResult, SqlToolkitError>;

    /// Parse potentially multi-statement SQL (separated by `;`).
    fn parse_multi(&self, sql: &str, dialect: Dialect) -> Result<ParseResult, SqlToolkitError>;
}

/// Render statement wrappers back to SQL strings.
pub trait SqlRender {
    fn render(
        &self,
        statement: &SqlStatement,
        dialect: Dialect,
        options: RenderOptions,
    ) -> Result<String, SqlToolkitError>;
}

/// Scope-aware analysis: resolve tables and columns through CTEs and
/// subqueries.
pub trait SqlScope {
    /// Extract table references with CTE-aware scope resolution.
    ///
    /// CTE names are excluded from the returned references; subquery tables
    /// are included. This is the correct source of dependency edges.
    fn extract_tables(&self, sql: &str, dialect: Dialect) -> Result<ScopeResult, SqlToolkitError>;

    /// Extract output columns, referenced columns, and star/aggregation/window
    /// flags from a statement.
    fn extract_columns(
        &self,
        sql: &str,
        dialect: Dialect,
    ) -> Result<ColumnExtraction, SqlToolkitError>;
}

/// Transpile SQL between dialects.
pub trait SqlTranspile {
    /// Convert SQL from one dialect to another.
    ///
    /// On failure the original SQL is returned with
    /// [`TranspileResult::fallback_used`] set rather than an error — callers
    /// that need strict guarantees check the flag.
    fn transpile(
        &self,
        sql: &str,
        source_dialect: Dialect,
        target_dialect: Dialect,
    ) -> Result<TranspileResult, SqlToolkitError>;
}

/// Normalize SQL for deterministic content hashing.
pub trait SqlNormalize {
    /// Normalize SQL to canonical form (scheme `v1`):
    ///
    /// 1. Strip comments.
    /// 2. Parse and regenerate with keyword normalization.
    /// 3. Reorder CTE definitions alphabetically, only when no CTE
    ///    forward-references another by name.
    fn normalize(&self, sql: &str, dialect: Dialect) -> Result<NormalizedSql, SqlToolkitError>;
}

/// Diff two SQL statements at the AST level.
pub trait SqlDiff {
    /// Compute a semantic diff. Two-phase: a fast cosmetic check via
    /// normalization, then a structural edit list.
    fn diff(&self, old_sql: &str, new_sql: &str, dialect: Dialect) -> AstDiffResult;

    /// Column-level changes between two SELECT statements. Columns present in
    /// both with identical expressions are omitted.
    fn column_changes(
        &self,
        old_sql: &str,
        new_sql: &str,
        dialect: Dialect,
    ) -> BTreeMap<String, ColumnChange>;
}

/// Detect dangerous SQL operations.
pub trait SqlSafety {
    /// Check SQL for destructive operations using AST-based detection
    /// (never regex).
    fn check(&self, sql: &str, dialect: Dialect, options: SafetyOptions) -> SafetyCheckResult;
}

/// Rewrite table references in SQL statements.
pub trait SqlRewrite {
    /// Rewrite catalog/schema qualifiers via AST mutation (never string
    /// replacement).
    fn rewrite_tables(
        &self,
        sql: &str,
        rules: &[RewriteRule],
        dialect: Dialect,
    ) -> RewriteResult;

    /// Safely quote an identifier for the given dialect.
    fn quote_identifier(&self, name: &str, dialect: Dialect) -> String;
}

/// Column-level lineage analysis.
pub trait SqlLineage {
    /// Trace each output column to its ultimate source columns across CTEs,
    /// joins, subqueries, and expressions.
    ///
    /// When a schema is supplied, `SELECT *` is expanded before tracing;
    /// without one, `*` is recorded as unresolved rather than fabricated.
    fn column_lineage(
        &self,
        sql: &str,
        dialect: Dialect,
        schema: Option<&SchemaMap>,
    ) -> Result<ColumnLineage, SqlToolkitError>;
}

/// Composite trait: a complete SQL toolkit implementation. This is what
/// consumer code receives from the factory.
pub trait SqlBackend:
    SqlParse
    + SqlRender
    + SqlScope
    + SqlTranspile
    + SqlNormalize
    + SqlDiff
    + SqlSafety
    + SqlRewrite
    + SqlLineage
    + Send
    + Sync
{
}
