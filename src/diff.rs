//! Structural diff between two snapshots.
//!
//! Operates on `{model_name → content_hash}` maps. Because content hashes
//! are computed from canonical normalized SQL, cosmetic edits never surface
//! as modifications here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Models added, removed, or modified between two snapshots. All lists are
/// sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub added_models: Vec<String>,
    pub removed_models: Vec<String>,
    pub modified_models: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added_models.is_empty()
            && self.removed_models.is_empty()
            && self.modified_models.is_empty()
    }

    /// Total number of models that differ between the snapshots.
    pub fn change_count(&self) -> usize {
        self.added_models.len() + self.removed_models.len() + self.modified_models.len()
    }
}

/// Compare two snapshot hash maps.
pub fn compute_structural_diff(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> DiffResult {
    let mut added_models = Vec::new();
    let mut modified_models = Vec::new();

    for (name, hash) in current {
        match previous.get(name) {
            None => added_models.push(name.clone()),
            Some(previous_hash) if previous_hash != hash => modified_models.push(name.clone()),
            Some(_) => {}
        }
    }

    let removed_models = previous
        .keys()
        .filter(|name| !current.contains_key(*name))
        .cloned()
        .collect();

    DiffResult {
        added_models,
        removed_models,
        modified_models,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identical_maps_produce_empty_diff() {
        let snapshot = hashes(&[("a", "h1"), ("b", "h2")]);
        let diff = compute_structural_diff(&snapshot, &snapshot);
        assert!(diff.is_empty());
        assert_eq!(diff.change_count(), 0);
    }

    #[test]
    fn test_added_removed_modified() {
        let previous = hashes(&[("keep", "h1"), ("gone", "h2"), ("edited", "h3")]);
        let current = hashes(&[("keep", "h1"), ("edited", "h3b"), ("fresh", "h4")]);

        let diff = compute_structural_diff(&previous, &current);
        assert_eq!(diff.added_models, vec!["fresh"]);
        assert_eq!(diff.removed_models, vec!["gone"]);
        assert_eq!(diff.modified_models, vec!["edited"]);
    }

    #[test]
    fn test_output_is_sorted() {
        let previous = hashes(&[]);
        let current = hashes(&[("z.model", "h"), ("a.model", "h"), ("m.model", "h")]);
        let diff = compute_structural_diff(&previous, &current);
        assert_eq!(diff.added_models, vec!["a.model", "m.model", "z.model"]);
    }
}
