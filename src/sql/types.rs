//! SQL toolkit shared types.
//!
//! Every type here is implementation-agnostic: consumer code operates on these
//! types exclusively, and the backing implementation converts to and from its
//! native AST internally. Nothing in this module names the parsing library —
//! the raw node travels inside [`SqlStatement`] as an erased `Any`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// Supported SQL dialects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Databricks,
    DuckDb,
    Redshift,
    /// Dialect of the local sandbox executor.
    Sqlite,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Databricks => "databricks",
            Dialect::DuckDb => "duckdb",
            Dialect::Redshift => "redshift",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Statement wrapper
// ---------------------------------------------------------------------------

/// Coarse classification of a parsed statement.
///
/// This is not a 1:1 mapping of any parser's node types — it is the subset
/// the control plane actually inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Create,
    Insert,
    Update,
    Delete,
    Drop,
    Alter,
    Truncate,
    Merge,
    Grant,
    Revoke,
    Other,
}

/// Opaque wrapper around a parsed SQL statement.
///
/// Consumers can inspect the [`StatementKind`], the source dialect, and the
/// canonical SQL text. The raw parser node is carried as an erased value that
/// only the backing implementation downcasts.
#[derive(Clone)]
pub struct SqlStatement {
    kind: StatementKind,
    dialect: Dialect,
    sql_text: String,
    raw: Arc<dyn Any + Send + Sync>,
}

impl SqlStatement {
    pub(crate) fn new(
        kind: StatementKind,
        dialect: Dialect,
        sql_text: String,
        raw: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            kind,
            dialect,
            sql_text,
            raw,
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Canonical SQL text of the statement, as regenerated from the AST.
    pub fn sql_text(&self) -> &str {
        &self.sql_text
    }

    /// Implementation escape hatch: the raw parser node.
    pub(crate) fn raw(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.raw
    }
}

impl fmt::Debug for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStatement")
            .field("kind", &self.kind)
            .field("dialect", &self.dialect)
            .field("sql_text", &self.sql_text)
            .finish_non_exhaustive()
    }
}

/// Result of parsing a SQL string. `statements` handles multi-statement
/// scripts (separated by `;`).
#[derive(Clone, Debug)]
pub struct ParseResult {
    pub statements: Vec<SqlStatement>,
    pub dialect: Dialect,
    pub warnings: Vec<String>,
}

impl ParseResult {
    /// Return the single statement, or an error if zero or multiple.
    pub fn single(&self) -> Result<&SqlStatement, SqlToolkitError> {
        if self.statements.len() != 1 {
            return Err(SqlToolkitError::Parse(format!(
                "Expected exactly 1 statement, got {}",
                self.statements.len()
            )));
        }
        Ok(&self.statements[0])
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// A resolved table reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    /// Return `catalog.schema.name`, omitting absent parts.
    pub fn fully_qualified(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(catalog) = self.catalog.as_deref() {
            parts.push(catalog);
        }
        if let Some(schema) = self.schema.as_deref() {
            parts.push(schema);
        }
        parts.push(&self.name);
        parts.join(".")
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

/// A column reference, optionally qualified by table or alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{table}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Result containers
// ---------------------------------------------------------------------------

/// Scope-aware table extraction result.
///
/// `referenced_tables` has CTE names excluded — the property that keeps CTEs
/// from appearing as external table dependencies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeResult {
    pub referenced_tables: Vec<TableRef>,
    pub cte_names: Vec<String>,
}

/// Columns extracted from a SQL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnExtraction {
    /// Output column names from the top-level SELECT, sorted.
    pub output_columns: Vec<String>,
    /// Every column reference in the query, deduplicated and sorted.
    pub referenced_columns: Vec<ColumnRef>,
    pub has_star: bool,
    pub has_aggregation: bool,
    pub has_window_functions: bool,
}

/// Canonicalization scheme version for [`NormalizedSql`]. Any change to the
/// normalization rules must change this tag, because content hashes derived
/// from normalized SQL are persisted.
pub const CANONICALIZATION_VERSION: &str = "v1";

/// Result of SQL normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedSql {
    pub normalized_sql: String,
    pub original_sql: String,
    pub applied_rules: Vec<&'static str>,
}

/// Result of transpiling SQL between dialects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranspileResult {
    pub output_sql: String,
    pub source_dialect: Dialect,
    pub target_dialect: Dialect,
    pub warnings: Vec<String>,
    /// Set when transpilation failed and the original SQL was passed through.
    /// Callers needing strict guarantees must check this flag.
    pub fallback_used: bool,
}

/// Types of AST edit operations. `Keep` operations are never reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffEditKind {
    Insert,
    Remove,
    Update,
    Move,
}

impl DiffEditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffEditKind::Insert => "insert",
            DiffEditKind::Remove => "remove",
            DiffEditKind::Update => "update",
            DiffEditKind::Move => "move",
        }
    }
}

/// A single edit operation in an AST diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEdit {
    pub kind: DiffEditKind,
    pub source_sql: String,
    pub target_sql: String,
}

/// Result of diffing two SQL statements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AstDiffResult {
    /// Semantic edits, deterministically sorted. Empty for identical or
    /// cosmetic-only changes.
    pub edits: Vec<DiffEdit>,
    pub is_identical: bool,
    /// True when the two sides normalize to the same canonical SQL (only
    /// whitespace, comments, or formatting differ).
    pub is_cosmetic_only: bool,
    /// Unified text diff of the two normalized forms, for human review.
    /// Empty when the change is identical or cosmetic-only.
    pub normalized_text_diff: String,
}

/// Column-level change classification between two SELECT statements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnChange {
    Added,
    Removed,
    Modified,
}

// ---------------------------------------------------------------------------
// Safety guard
// ---------------------------------------------------------------------------

/// Severity of a safety violation. Error-level violations block execution;
/// warnings are surfaced but do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

/// Kinds of dangerous SQL operations the guard detects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyViolationKind {
    DropTable,
    DropView,
    DropSchema,
    Truncate,
    DeleteWithoutWhere,
    AlterDropColumn,
    Grant,
    Revoke,
    RawExec,
    CreateUser,
    InsertOverwriteAll,
    Insert,
    CreateObject,
    Unparseable,
}

/// A dangerous SQL operation detected by the safety guard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub kind: SafetyViolationKind,
    pub target: String,
    pub detail: String,
    pub severity: ViolationSeverity,
}

/// Options controlling which statement classes the guard tolerates.
#[derive(Clone, Copy, Debug)]
pub struct SafetyOptions {
    pub allow_create: bool,
    pub allow_insert: bool,
}

impl Default for SafetyOptions {
    fn default() -> Self {
        Self {
            allow_create: true,
            allow_insert: false,
        }
    }
}

/// Result of a SQL safety check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafetyCheckResult {
    pub is_safe: bool,
    pub violations: Vec<SafetyViolation>,
    pub checked_statements: usize,
}

impl SafetyCheckResult {
    /// True when at least one violation has error severity.
    pub fn has_blocking_violation(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Error)
    }
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// A table-reference rewrite rule. Rules match fully-qualified,
/// schema-qualified, catalog-qualified, and unqualified tables in that
/// order of specificity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteRule {
    pub source_catalog: Option<String>,
    pub source_schema: Option<String>,
    pub target_catalog: Option<String>,
    pub target_schema: Option<String>,
}

/// Result of rewriting table references in SQL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteResult {
    pub rewritten_sql: String,
    pub tables_rewritten: Vec<TableRef>,
    pub tables_unchanged: Vec<TableRef>,
}

// ---------------------------------------------------------------------------
// Column-level lineage
// ---------------------------------------------------------------------------

/// Classification of the transformation between an output column and one of
/// its source columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Direct,
    Expression,
    Aggregation,
    Window,
    Case,
    Literal,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Direct => "direct",
            TransformKind::Expression => "expression",
            TransformKind::Aggregation => "aggregation",
            TransformKind::Window => "window",
            TransformKind::Case => "case",
            TransformKind::Literal => "literal",
        }
    }
}

/// One hop in a column lineage trace: an output column derived from a source
/// column, possibly through a transformation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageNode {
    pub column: String,
    pub source_table: Option<String>,
    pub source_column: Option<String>,
    pub transform: TransformKind,
    pub transform_sql: String,
}

/// Schema information supplied to lineage: table name → ordered column list.
pub type SchemaMap = BTreeMap<String, Vec<String>>;

/// Column lineage for a single SQL statement. Maps each output column to the
/// ultimate source columns it derives from; columns that cannot be proven are
/// listed as unresolved rather than fabricated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnLineage {
    pub column_lineage: BTreeMap<String, Vec<LineageNode>>,
    pub unresolved_columns: Vec<String>,
    pub dialect: Dialect,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by SQL toolkit capabilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlToolkitError {
    /// SQL could not be parsed.
    #[error("SQL parse error: {0}")]
    Parse(String),

    /// SQL could not be transpiled between dialects (and fallback was not
    /// permitted).
    #[error("SQL transpile error: {0}")]
    Transpile(String),

    /// SQL could not be normalized to canonical form.
    #[error("SQL normalization error: {0}")]
    Normalize(String),

    /// Column lineage analysis failed.
    #[error("SQL lineage error: {0}")]
    Lineage(String),
}
