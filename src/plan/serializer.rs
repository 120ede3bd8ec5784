//! Canonical plan serialization.
//!
//! Plan JSON is UTF-8 with keys sorted at every nesting level and dates as
//! ISO-8601 strings, so file-level hashes of serialized plans are stable.
//! Deserialization validates the document shape first and reports every
//! problem found, not just the first.

use std::path::Path;

use serde_json::Value;

use crate::errors::CoreError;
use crate::plan::Plan;

/// Serialize a plan to canonical pretty-printed JSON with sorted keys.
pub fn serialize_plan(plan: &Plan) -> Result<String, CoreError> {
    let value = serde_json::to_value(plan)
        .map_err(|e| CoreError::Serialization(format!("failed to encode plan: {e}")))?;
    serde_json::to_string_pretty(&value)
        .map_err(|e| CoreError::Serialization(format!("failed to encode plan: {e}")))
}

/// Parse and validate a serialized plan.
pub fn deserialize_plan(content: &str) -> Result<Plan, CoreError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| CoreError::Serialization(format!("invalid plan JSON: {e}")))?;
    validate_plan_schema(&value)?;
    serde_json::from_value(value)
        .map_err(|e| CoreError::Serialization(format!("invalid plan document: {e}")))
}

/// Write a plan file. The output is byte-stable for a given plan.
pub fn save_plan_file(plan: &Plan, path: &Path) -> Result<(), CoreError> {
    std::fs::write(path, serialize_plan(plan)?)?;
    Ok(())
}

/// Load and validate a plan file.
pub fn load_plan_file(path: &Path) -> Result<Plan, CoreError> {
    let content = std::fs::read_to_string(path)?;
    deserialize_plan(&content)
}

const TOP_LEVEL_KEYS: &[&str] = &["plan_id", "base", "target", "created_at", "summary", "steps"];
const REQUIRED_STEP_KEYS: &[&str] = &[
    "step_id",
    "model",
    "run_type",
    "depends_on",
    "parallel_group",
    "reason",
];

/// Validate the shape of a plan document, collecting every error.
pub fn validate_plan_schema(value: &Value) -> Result<(), CoreError> {
    let mut errors = Vec::new();

    let Some(object) = value.as_object() else {
        return Err(CoreError::Serialization(
            "plan document must be a JSON object".to_string(),
        ));
    };

    for key in object.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            errors.push(format!("unknown top-level key `{key}`"));
        }
    }
    for key in TOP_LEVEL_KEYS {
        if !object.contains_key(*key) {
            errors.push(format!("missing required key `{key}`"));
        }
    }

    if let Some(steps) = object.get("steps") {
        match steps.as_array() {
            None => errors.push("`steps` must be an array".to_string()),
            Some(steps) => {
                for (index, step) in steps.iter().enumerate() {
                    validate_step(index, step, &mut errors);
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Serialization(format!(
            "plan schema validation failed: {}",
            errors.join("; ")
        )))
    }
}

fn validate_step(index: usize, step: &Value, errors: &mut Vec<String>) {
    let Some(object) = step.as_object() else {
        errors.push(format!("step {index} must be an object"));
        return;
    };

    for key in REQUIRED_STEP_KEYS {
        if !object.contains_key(*key) {
            errors.push(format!("step {index}: missing required key `{key}`"));
        }
    }

    match object.get("run_type").and_then(Value::as_str) {
        Some("FULL_REFRESH") => {}
        Some("INCREMENTAL") => {
            if !object.contains_key("input_range") {
                errors.push(format!("step {index}: INCREMENTAL step has no input_range"));
            }
        }
        Some(other) => errors.push(format!("step {index}: unknown run_type `{other}`")),
        None => {}
    }

    if let Some(range) = object.get("input_range") {
        let Some(range) = range.as_object() else {
            errors.push(format!("step {index}: input_range must be an object"));
            return;
        };
        for bound in ["start", "end"] {
            match range.get(bound).and_then(Value::as_str) {
                None => errors.push(format!("step {index}: input_range missing `{bound}`")),
                Some(text) => {
                    if text.parse::<chrono::NaiveDate>().is_err() {
                        errors.push(format!(
                            "step {index}: input_range.{bound} `{text}` is not a valid date"
                        ));
                    }
                }
            }
        }
    }
}
