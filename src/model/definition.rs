//! Model definitions.
//!
//! A model is a named SQL artefact the user wants materialised in the
//! warehouse. Definitions are produced by the loader from SQL files with
//! metadata headers and are the unit the differ, planner, and executor
//! operate on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a model is recomputed when its inputs or definition change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKind {
    /// Rebuild the full output on every run.
    #[default]
    FullRefresh,
    /// Process only a date range bounded by the model's watermark. Requires
    /// `time_column`.
    IncrementalByTimeRange,
    /// Merge rows on a unique key. Requires `unique_key`.
    MergeByKey,
    /// A view; no materialised data of its own.
    View,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::FullRefresh => "FULL_REFRESH",
            ModelKind::IncrementalByTimeRange => "INCREMENTAL_BY_TIME_RANGE",
            ModelKind::MergeByKey => "MERGE_BY_KEY",
            ModelKind::View => "VIEW",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FULL_REFRESH" => Ok(ModelKind::FullRefresh),
            "INCREMENTAL_BY_TIME_RANGE" => Ok(ModelKind::IncrementalByTimeRange),
            "MERGE_BY_KEY" => Ok(ModelKind::MergeByKey),
            "VIEW" => Ok(ModelKind::View),
            other => Err(format!("Invalid model kind: {other}")),
        }
    }
}

/// How the model's output lands in the warehouse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Materialization {
    #[default]
    Table,
    View,
    InsertOverwrite,
    Merge,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Materialization::Table => "TABLE",
            Materialization::View => "VIEW",
            Materialization::InsertOverwrite => "INSERT_OVERWRITE",
            Materialization::Merge => "MERGE",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Materialization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TABLE" => Ok(Materialization::Table),
            "VIEW" => Ok(Materialization::View),
            "INSERT_OVERWRITE" => Ok(Materialization::InsertOverwrite),
            "MERGE" => Ok(Materialization::Merge),
            other => Err(format!("Invalid materialization: {other}")),
        }
    }
}

/// Enforcement level for a model's schema contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractMode {
    #[default]
    Disabled,
    /// Violations are reported but never block a plan.
    Warn,
    /// Warning-level violations are upgraded to breaking.
    Strict,
}

impl FromStr for ContractMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DISABLED" => Ok(ContractMode::Disabled),
            "WARN" => Ok(ContractMode::Warn),
            "STRICT" => Ok(ContractMode::Strict),
            other => Err(format!("Invalid contract mode: {other}")),
        }
    }
}

/// One column the model's contract promises to its consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractColumn {
    pub name: String,
    pub data_type: String,
}

/// A fully loaded model definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Dotted canonical identifier, unique per tenant.
    pub name: String,
    pub kind: ModelKind,
    pub materialization: Materialization,
    /// Required iff `kind` is `INCREMENTAL_BY_TIME_RANGE`.
    pub time_column: Option<String>,
    /// Required iff `kind` is `MERGE_BY_KEY`.
    pub unique_key: Option<String>,
    pub partition_by: Option<String>,
    pub incremental_strategy: Option<String>,
    pub owner: Option<String>,
    pub tags: Vec<String>,
    /// SQL exactly as written in the file, `ref()` macros included.
    pub raw_sql: String,
    /// SQL with `ref()` macros resolved to canonical model names.
    pub clean_sql: String,
    /// SHA-256 of the canonical normalized SQL; cosmetic edits do not change
    /// it.
    pub content_hash: String,
    /// Sorted union of header-declared and parser-discovered dependencies.
    pub dependencies: Vec<String>,
    pub contract_mode: ContractMode,
    pub contract_columns: Vec<ContractColumn>,
}

impl ModelDefinition {
    /// True when the planner should compute an input date range for runs of
    /// this model.
    pub fn is_incremental(&self) -> bool {
        self.kind == ModelKind::IncrementalByTimeRange
    }
}

impl fmt::Display for ModelDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ModelKind::FullRefresh,
            ModelKind::IncrementalByTimeRange,
            ModelKind::MergeByKey,
            ModelKind::View,
        ] {
            let parsed: ModelKind = kind.as_str().parse().expect("parse");
            assert_eq!(parsed, kind);
        }
        assert!("SNAPSHOT".parse::<ModelKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_as_wire_name() {
        let json = serde_json::to_string(&ModelKind::IncrementalByTimeRange).expect("json");
        assert_eq!(json, "\"INCREMENTAL_BY_TIME_RANGE\"");
    }

    #[test]
    fn test_materialization_parse_is_case_insensitive() {
        assert_eq!(
            "insert_overwrite".parse::<Materialization>(),
            Ok(Materialization::InsertOverwrite)
        );
    }
}
