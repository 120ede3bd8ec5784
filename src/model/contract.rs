//! Schema-contract validation.
//!
//! A contract declares the columns a model promises to its consumers.
//! Validation compares the promise against what the model's SQL actually
//! produces (and, when available, against the warehouse-observed schema) and
//! classifies each discrepancy as BREAKING, WARNING, or INFO.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::model::definition::{ContractMode, ModelDefinition};
use crate::sql::toolkit;
use crate::sql::types::Dialect;

/// Severity of a contract violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractSeverity {
    Breaking,
    Warning,
    Info,
}

impl ContractSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractSeverity::Breaking => "BREAKING",
            ContractSeverity::Warning => "WARNING",
            ContractSeverity::Info => "INFO",
        }
    }
}

impl fmt::Display for ContractSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrepancy between a model's contract and its observed output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractViolation {
    pub model: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub severity: ContractSeverity,
    pub detail: String,
}

impl ContractViolation {
    pub fn is_breaking(&self) -> bool {
        self.severity == ContractSeverity::Breaking
    }
}

/// Validate a model's contract against the columns its SQL produces.
///
/// Only column presence can be proven from SQL alone; type conformance needs
/// the warehouse-observed schema (see [`validate_contract_with_schema`]).
pub fn validate_contract(model: &ModelDefinition) -> Result<Vec<ContractViolation>, CoreError> {
    if model.contract_mode == ContractMode::Disabled || model.contract_columns.is_empty() {
        return Ok(Vec::new());
    }

    let columns = toolkit().extract_columns(&model.clean_sql, Dialect::Databricks)?;

    let mut violations = Vec::new();

    if columns.has_star {
        violations.push(escalate(
            model,
            ContractViolation {
                model: model.name.clone(),
                column: "*".to_string(),
                expected: None,
                actual: None,
                severity: ContractSeverity::Warning,
                detail: "SELECT * prevents contract verification".to_string(),
            },
        ));
        return Ok(violations);
    }

    for contracted in &model.contract_columns {
        if !columns.output_columns.iter().any(|c| c == &contracted.name) {
            violations.push(ContractViolation {
                model: model.name.clone(),
                column: contracted.name.clone(),
                expected: Some(contracted.data_type.clone()),
                actual: None,
                severity: ContractSeverity::Breaking,
                detail: format!("contracted column `{}` missing from output", contracted.name),
            });
        }
    }

    for actual in &columns.output_columns {
        if !model.contract_columns.iter().any(|c| &c.name == actual) {
            violations.push(ContractViolation {
                model: model.name.clone(),
                column: actual.clone(),
                expected: None,
                actual: Some(actual.clone()),
                severity: ContractSeverity::Info,
                detail: format!("column `{actual}` is produced but not contracted"),
            });
        }
    }

    Ok(violations)
}

/// Validate a model's contract against a warehouse-observed schema of
/// `(column, type)` pairs.
pub fn validate_contract_with_schema(
    model: &ModelDefinition,
    observed: &[(String, String)],
) -> Vec<ContractViolation> {
    if model.contract_mode == ContractMode::Disabled || model.contract_columns.is_empty() {
        return Vec::new();
    }

    let mut violations = Vec::new();

    for contracted in &model.contract_columns {
        match observed.iter().find(|(name, _)| name == &contracted.name) {
            None => violations.push(ContractViolation {
                model: model.name.clone(),
                column: contracted.name.clone(),
                expected: Some(contracted.data_type.clone()),
                actual: None,
                severity: ContractSeverity::Breaking,
                detail: format!(
                    "contracted column `{}` missing from warehouse schema",
                    contracted.name
                ),
            }),
            Some((_, observed_type)) => {
                let observed_type = observed_type.to_lowercase();
                if !contracted.data_type.is_empty() && observed_type != contracted.data_type {
                    violations.push(escalate(
                        model,
                        ContractViolation {
                            model: model.name.clone(),
                            column: contracted.name.clone(),
                            expected: Some(contracted.data_type.clone()),
                            actual: Some(observed_type),
                            severity: ContractSeverity::Warning,
                            detail: format!(
                                "column `{}` type drifted from contract",
                                contracted.name
                            ),
                        },
                    ));
                }
            }
        }
    }

    for (name, observed_type) in observed {
        if !model.contract_columns.iter().any(|c| &c.name == name) {
            violations.push(ContractViolation {
                model: model.name.clone(),
                column: name.clone(),
                expected: None,
                actual: Some(observed_type.to_lowercase()),
                severity: ContractSeverity::Info,
                detail: format!("column `{name}` exists but is not contracted"),
            });
        }
    }

    violations
}

/// STRICT mode upgrades warnings to breaking.
fn escalate(model: &ModelDefinition, mut violation: ContractViolation) -> ContractViolation {
    if model.contract_mode == ContractMode::Strict
        && violation.severity == ContractSeverity::Warning
    {
        violation.severity = ContractSeverity::Breaking;
    }
    violation
}
