//! Config metadata: the validation schema for node and controller config.
//!
//! The metadata document maps dotted config paths to a descriptor with the
//! value type, optional constraints, and the action a change to that key
//! requires on the node. Validation walks the leaves of a config document
//! and checks each against its descriptor; in strict mode a leaf without a
//! descriptor is an error, otherwise it is only reported.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lattice_primitives::wire::ConfigAction;

pub type Result<T, E = MetadataError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed reading metadata file")]
    Read(#[source] std::io::Error),
    #[error("metadata file is not valid JSON")]
    Parse(#[source] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamType {
    Integer,
    Float,
    String,
    Boolean,
    Object,
}

/// Value constraints, all optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Constraints {
    pub allowed_values: Option<Vec<Value>>,
    pub int_ranges: Option<Vec<(i64, i64)>>,
    pub float_ranges: Option<Vec<(f64, f64)>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetadataEntry {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub constraints: Constraints,
    pub action: ConfigAction,
    /// Entry participates in strict validation.
    pub strict: bool,
    pub deprecated: bool,
}

impl Default for MetadataEntry {
    fn default() -> Self {
        Self {
            param_type: ParamType::String,
            constraints: Constraints::default(),
            action: ConfigAction::NoAction,
            strict: true,
            deprecated: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub unrecognized_keys: Vec<String>,
    pub deprecated_keys: Vec<String>,
}

impl ValidationResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The loaded schema.
#[derive(Clone, Debug, Default)]
pub struct ConfigMetadata {
    entries: BTreeMap<String, MetadataEntry>,
    /// Unrecognized keys are hard errors.
    strict: bool,
}

impl ConfigMetadata {
    pub fn new(entries: BTreeMap<String, MetadataEntry>, strict: bool) -> Self {
        Self { entries, strict }
    }

    pub fn from_file(path: &std::path::Path, strict: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(MetadataError::Read)?;
        Self::from_json(&contents, strict)
    }

    pub fn from_json(json: &str, strict: bool) -> Result<Self> {
        let entries = serde_json::from_str(json).map_err(MetadataError::Parse)?;
        Ok(Self { entries, strict })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.entries).unwrap_or_else(|_| "{}".to_owned())
    }

    pub fn get(&self, path: &str) -> Option<&MetadataEntry> {
        self.entries.get(path).or_else(|| {
            // Map-style entries describe all children of a parent path with
            // a `*` component, e.g. `tunnelConfig.*.dstNodeName`.
            let mut parts: Vec<&str> = path.split('.').collect();
            for i in 0..parts.len() {
                let original = parts[i];
                parts[i] = "*";
                if let Some(entry) = self.entries.get(&parts.join(".")) {
                    return Some(entry);
                }
                parts[i] = original;
            }
            None
        })
    }

    /// Validate a whole config document.
    pub fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();
        self.walk(config, String::new(), &mut result);
        result
    }

    fn walk(&self, value: &Value, path: String, result: &mut ValidationResult) {
        if let Value::Object(map) = value {
            // Objects recurse unless the metadata pins this path as a leaf
            // object value.
            let is_leaf_object = self
                .get(&path)
                .map(|e| e.param_type == ParamType::Object)
                .unwrap_or(false);
            if !is_leaf_object {
                for (key, child) in map {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.walk(child, child_path, result);
                }
                return;
            }
        }

        let Some(entry) = self.get(&path) else {
            result.unrecognized_keys.push(path.clone());
            if self.strict {
                result.errors.push(format!("unrecognized config key `{path}`"));
            }
            return;
        };
        if entry.deprecated {
            result.deprecated_keys.push(path.clone());
        }
        if let Some(err) = check_value(&path, entry, value) {
            result.errors.push(err);
        }
    }

    /// The set of actions required by changes to `paths`, or `None` when any
    /// changed path has no metadata (forcing a full config push).
    pub fn actions_for<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Option<BTreeSet<ConfigAction>> {
        let mut actions = BTreeSet::new();
        for path in paths {
            actions.insert(self.get(path)?.action);
        }
        Some(actions)
    }
}

fn check_value(path: &str, entry: &MetadataEntry, value: &Value) -> Option<String> {
    let type_ok = match entry.param_type {
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Float => value.is_number(),
        ParamType::String => value.is_string(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Object => value.is_object(),
    };
    if !type_ok {
        return Some(format!(
            "config key `{path}` has wrong type (expected {:?})",
            entry.param_type
        ));
    }

    if let Some(allowed) = &entry.constraints.allowed_values {
        if !allowed.contains(value) {
            return Some(format!("config key `{path}` value not in allowed set"));
        }
    }
    if let Some(ranges) = &entry.constraints.int_ranges {
        if let Some(n) = value.as_i64() {
            if !ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&n)) {
                return Some(format!("config key `{path}` value {n} out of range"));
            }
        }
    }
    if let Some(ranges) = &entry.constraints.float_ranges {
        if let Some(n) = value.as_f64() {
            if !ranges.iter().any(|(lo, hi)| n >= *lo && n <= *hi) {
                return Some(format!("config key `{path}` value {n} out of range"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(strict: bool) -> ConfigMetadata {
        let mut entries = BTreeMap::new();
        entries.insert(
            "sys.managedConfig".to_owned(),
            MetadataEntry {
                param_type: ParamType::Boolean,
                ..Default::default()
            },
        );
        entries.insert(
            "radio.txPower".to_owned(),
            MetadataEntry {
                param_type: ParamType::Integer,
                constraints: Constraints {
                    int_ranges: Some(vec![(0, 40)]),
                    ..Default::default()
                },
                action: ConfigAction::ReloadFirmware,
                ..Default::default()
            },
        );
        entries.insert(
            "tunnelConfig.*.dstNodeName".to_owned(),
            MetadataEntry {
                param_type: ParamType::String,
                action: ConfigAction::RestartSquire,
                ..Default::default()
            },
        );
        ConfigMetadata::new(entries, strict)
    }

    #[test]
    fn valid_document_passes() {
        let result = metadata(true).validate(&json!({
            "sys": {"managedConfig": true},
            "radio": {"txPower": 20},
        }));
        assert!(result.ok(), "{:?}", result.errors);
        assert!(result.unrecognized_keys.is_empty());
    }

    #[test]
    fn out_of_range_value_fails() {
        let result = metadata(true).validate(&json!({"radio": {"txPower": 99}}));
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn wrong_type_fails() {
        let result = metadata(true).validate(&json!({"sys": {"managedConfig": "yes"}}));
        assert!(!result.ok());
    }

    #[test]
    fn unknown_key_only_errors_in_strict_mode() {
        let doc = json!({"mystery": 1});
        let strict = metadata(true).validate(&doc);
        assert!(!strict.ok());
        let lax = metadata(false).validate(&doc);
        assert!(lax.ok());
        assert_eq!(lax.unrecognized_keys, vec!["mystery"]);
    }

    #[test]
    fn wildcard_paths_match_map_children() {
        let result = metadata(true).validate(&json!({
            "tunnelConfig": {"t1": {"dstNodeName": "node-b"}},
        }));
        assert!(result.ok(), "{:?}", result.errors);
    }

    #[test]
    fn actions_for_changed_paths() {
        let meta = metadata(true);
        let actions = meta
            .actions_for(["radio.txPower", "sys.managedConfig"])
            .unwrap();
        assert!(actions.contains(&ConfigAction::ReloadFirmware));
        assert!(actions.contains(&ConfigAction::NoAction));
        assert!(meta.actions_for(["radio.txPower", "nope"]).is_none());
    }

    #[test]
    fn json_round_trip() {
        let meta = metadata(false);
        let json = meta.to_json();
        let reloaded = ConfigMetadata::from_json(&json, false).unwrap();
        assert_eq!(reloaded.get("radio.txPower"), meta.get("radio.txPower"));
    }
}
