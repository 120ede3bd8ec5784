//! Snapshots: immutable captures of `{model_name → model_version}` for one
//! environment.
//!
//! A snapshot's identity is a hash over its tenant, environment, and sorted
//! `(name, version_id)` pairs, so the same catalogue state always produces
//! the same snapshot id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::deterministic_id;
use crate::model::definition::ModelDefinition;

/// One model's pinned version inside a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version_id: String,
    pub model_name: String,
    /// Hash of the canonical normalized SQL.
    pub canonical_sql_hash: String,
    /// Hash over kind, materialization, and name — metadata-only changes
    /// version a model without changing its SQL hash.
    pub metadata_hash: String,
}

/// An immutable point-in-time capture of the model catalogue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub versions: BTreeMap<String, ModelVersion>,
}

impl Snapshot {
    /// Capture a snapshot from loaded model definitions.
    pub fn from_models(tenant_id: &str, environment: &str, models: &[ModelDefinition]) -> Self {
        let mut versions = BTreeMap::new();
        for model in models {
            let version_id = deterministic_id(&[&model.name, &model.content_hash]);
            let metadata_hash = deterministic_id(&[
                model.kind.as_str(),
                model.materialization.as_str(),
                &model.name,
            ]);
            versions.insert(
                model.name.clone(),
                ModelVersion {
                    version_id,
                    model_name: model.name.clone(),
                    canonical_sql_hash: model.content_hash.clone(),
                    metadata_hash,
                },
            );
        }
        let snapshot_id = Self::compute_id(tenant_id, environment, &versions);
        Self {
            snapshot_id,
            environment: environment.to_string(),
            created_at: Utc::now(),
            versions,
        }
    }

    /// Deterministic snapshot identity over tenant, environment, and sorted
    /// `(name, version_id)` pairs.
    pub fn compute_id(
        tenant_id: &str,
        environment: &str,
        versions: &BTreeMap<String, ModelVersion>,
    ) -> String {
        let mut parts: Vec<&str> = vec![tenant_id, environment];
        let pairs: Vec<String> = versions
            .iter()
            .map(|(name, version)| format!("{name}={}", version.version_id))
            .collect();
        parts.extend(pairs.iter().map(|p| p.as_str()));
        deterministic_id(&parts)
    }

    /// The `{model_name → content_hash}` view the structural differ consumes.
    pub fn hash_map(&self) -> BTreeMap<String, String> {
        self.versions
            .iter()
            .map(|(name, version)| (name.clone(), version.canonical_sql_hash.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
