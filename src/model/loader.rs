//! Model loader.
//!
//! Reads SQL files from a directory tree. Each file begins with a header of
//! `-- key: value` comment lines, followed by a blank line, then the SQL
//! body. Loading is two-pass: first every header and raw body is parsed so
//! the full name set is known, then `{{ ref('name') }}` macros are resolved
//! and dependencies are discovered through the SQL toolkit's scope analyzer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::CoreError;
use crate::hash::ContentHash;
use crate::model::definition::{
    ContractColumn, ContractMode, Materialization, ModelDefinition, ModelKind,
};
use crate::sql::types::Dialect;
use crate::sql::toolkit;

const RECOGNISED_KEYS: &[&str] = &[
    "name",
    "kind",
    "materialization",
    "time_column",
    "unique_key",
    "partition_by",
    "incremental_strategy",
    "owner",
    "tags",
    "dependencies",
    "contract_mode",
    "contract_columns",
];

/// Load and parse every `.sql` model file under `dir`, recursively.
///
/// Files are visited in sorted path order so repeated loads of the same tree
/// produce identical output.
pub fn load_models_from_directory(dir: &Path) -> Result<Vec<ModelDefinition>, CoreError> {
    let mut files = Vec::new();
    collect_sql_files(dir, &mut files)?;
    files.sort();

    // Pass 1: headers and raw bodies.
    let mut raw_models = Vec::new();
    let mut names = BTreeSet::new();
    for path in &files {
        let content = std::fs::read_to_string(path)?;
        let raw = parse_model_file(path, &content)?;
        if !names.insert(raw.name.clone()) {
            return Err(CoreError::Validation(format!(
                "Duplicate model name `{}` (second occurrence in {})",
                raw.name,
                path.display()
            )));
        }
        raw_models.push(raw);
    }

    // Pass 2: resolve refs, discover dependencies, hash canonical SQL.
    let tk = toolkit();
    let mut models = Vec::new();
    for raw in raw_models {
        let clean_sql = resolve_refs(&raw.body);

        let mut dependencies: BTreeSet<String> = raw.declared_dependencies.iter().cloned().collect();
        match tk.extract_tables(&clean_sql, Dialect::Databricks) {
            Ok(scope) => {
                for table in &scope.referenced_tables {
                    let candidate = table.fully_qualified();
                    if names.contains(&candidate) && candidate != raw.name {
                        dependencies.insert(candidate);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    "dependency discovery failed for model {}: {err}; using declared dependencies only",
                    raw.name
                );
            }
        }

        let content_hash = match tk.normalize(&clean_sql, Dialect::Databricks) {
            Ok(normalized) => ContentHash::compute(normalized.normalized_sql.as_bytes()).to_hex(),
            Err(err) => {
                tracing::warn!(
                    "normalization failed for model {}: {err}; hashing trimmed SQL instead",
                    raw.name
                );
                ContentHash::compute(clean_sql.trim().as_bytes()).to_hex()
            }
        };

        let model = ModelDefinition {
            name: raw.name,
            kind: raw.kind,
            materialization: raw.materialization,
            time_column: raw.time_column,
            unique_key: raw.unique_key,
            partition_by: raw.partition_by,
            incremental_strategy: raw.incremental_strategy,
            owner: raw.owner,
            tags: raw.tags,
            raw_sql: raw.body,
            clean_sql,
            content_hash,
            dependencies: dependencies.into_iter().collect(),
            contract_mode: raw.contract_mode,
            contract_columns: raw.contract_columns,
        };
        validate_model(&model)?;
        models.push(model);
    }

    tracing::info!("loaded {} models from {}", models.len(), dir.display());
    Ok(models)
}

fn collect_sql_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), CoreError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_sql_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    Ok(())
}

struct RawModel {
    name: String,
    kind: ModelKind,
    materialization: Materialization,
    time_column: Option<String>,
    unique_key: Option<String>,
    partition_by: Option<String>,
    incremental_strategy: Option<String>,
    owner: Option<String>,
    tags: Vec<String>,
    declared_dependencies: Vec<String>,
    contract_mode: ContractMode,
    contract_columns: Vec<ContractColumn>,
    body: String,
}

/// Parse one model file into its header fields and SQL body.
fn parse_model_file(path: &Path, content: &str) -> Result<RawModel, CoreError> {
    let mut header: BTreeMap<String, String> = BTreeMap::new();
    let mut body_start = 0;

    for (offset, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            body_start = offset + 1;
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("--") else {
            body_start = offset;
            break;
        };
        body_start = offset + 1;
        match comment.split_once(':') {
            Some((key, value)) => {
                let key = key.trim().to_lowercase();
                if !RECOGNISED_KEYS.contains(&key.as_str()) {
                    tracing::warn!(
                        "unknown header key `{key}` in {}; ignoring",
                        path.display()
                    );
                    continue;
                }
                header.insert(key, value.trim().to_string());
            }
            None => {
                tracing::warn!(
                    "malformed header line in {}: `{trimmed}`; ignoring",
                    path.display()
                );
            }
        }
    }

    let body: String = content
        .lines()
        .skip(body_start)
        .collect::<Vec<_>>()
        .join("\n");

    let name = match header.get("name") {
        Some(name) => name.clone(),
        None => path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    if name.is_empty() {
        return Err(CoreError::Validation(format!(
            "Model file {} has no name",
            path.display()
        )));
    }

    let kind = parse_header_enum(&header, "kind", path)?.unwrap_or_default();
    let materialization = parse_header_enum(&header, "materialization", path)?.unwrap_or_default();
    let contract_mode = parse_header_enum(&header, "contract_mode", path)?.unwrap_or_default();

    Ok(RawModel {
        name,
        kind,
        materialization,
        time_column: header.get("time_column").cloned(),
        unique_key: header.get("unique_key").cloned(),
        partition_by: header.get("partition_by").cloned(),
        incremental_strategy: header.get("incremental_strategy").cloned(),
        owner: header.get("owner").cloned(),
        tags: split_list(header.get("tags")),
        declared_dependencies: split_list(header.get("dependencies")),
        contract_mode,
        contract_columns: parse_contract_columns(header.get("contract_columns")),
        body,
    })
}

fn parse_header_enum<T: FromStr<Err = String>>(
    header: &BTreeMap<String, String>,
    key: &str,
    path: &Path,
) -> Result<Option<T>, CoreError> {
    match header.get(key) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|err| {
            CoreError::Validation(format!("{err} (in {})", path.display()))
        }),
    }
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `contract_columns` header entries have the shape `name:type, name:type`.
fn parse_contract_columns(value: Option<&String>) -> Vec<ContractColumn> {
    split_list(value)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((name, data_type)) => ContractColumn {
                name: name.trim().to_string(),
                data_type: data_type.trim().to_lowercase(),
            },
            None => ContractColumn {
                name: entry,
                data_type: String::new(),
            },
        })
        .collect()
}

/// Replace `{{ ref('model.name') }}` macros with the bare canonical name.
///
/// Other template placeholders (e.g. `{{ start_date }}`) are left verbatim
/// for the executor's parameter substitution.
pub fn resolve_refs(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(open) = rest.find("{{") {
        let (before, after_open) = rest.split_at(open);
        output.push_str(before);
        let Some(close) = after_open.find("}}") else {
            output.push_str(after_open);
            return output;
        };
        let inner = &after_open[2..close];
        match ref_target(inner) {
            Some(name) => output.push_str(name),
            None => output.push_str(&after_open[..close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    output.push_str(rest);
    output
}

/// Extract the model name from a `ref('...')` macro body, tolerating
/// whitespace and either quote style.
fn ref_target(inner: &str) -> Option<&str> {
    let inner = inner.trim();
    let args = inner.strip_prefix("ref")?.trim_start();
    let args = args.strip_prefix('(')?.trim_start();
    let args = args.strip_suffix(')')?.trim_end();
    let quoted = args.trim();
    let name = quoted
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| {
            quoted
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
        })?;
    let name = name.trim();
    if name.is_empty() { None } else { Some(name) }
}

fn validate_model(model: &ModelDefinition) -> Result<(), CoreError> {
    if model.kind == ModelKind::IncrementalByTimeRange && model.time_column.is_none() {
        return Err(CoreError::Validation(format!(
            "Model `{}` is INCREMENTAL_BY_TIME_RANGE but declares no time_column",
            model.name
        )));
    }
    if model.kind == ModelKind::MergeByKey && model.unique_key.is_none() {
        return Err(CoreError::Validation(format!(
            "Model `{}` is MERGE_BY_KEY but declares no unique_key",
            model.name
        )));
    }
    Ok(())
}
