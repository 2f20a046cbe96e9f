//! Controller self-configuration.
//!
//! One JSON document governs the controller itself: feature flags, the
//! golden-image policy, and HA knobs. Writes pass through the same metadata
//! validator as node config, persist with the same tmp+rename discipline,
//! and yield a set of controller-side actions the caller dispatches to
//! in-process effects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use lattice_primitives::wire::ConfigAction;

use super::helper::{
    ConfigError, Result, canonical_json, changed_paths, prune_nulls, write_atomic,
};
use super::metadata::ConfigMetadata;
use crate::settings::ConfigOptions;

/// Golden-image reconciliation policy, stored under `upgradeParams.goldenImage`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoldenImagePolicy {
    pub enabled: bool,
    /// Board id -> target image version.
    pub versions: BTreeMap<String, String>,
    /// (node, version) pairs excluded after failures.
    pub node_blacklist: BTreeMap<String, String>,
    /// Nodes picked per reconciliation cycle; zero = unbounded.
    pub batch_limit: usize,
    pub timeout_sec: i64,
    /// Civil-time window `HH:MM-HH:MM` during which commits may fire;
    /// empty = always.
    pub time_restriction: String,
}

#[derive(Debug)]
pub struct ControllerConfigStore {
    value: Value,
    metadata: ConfigMetadata,
    file: Option<PathBuf>,
}

impl ControllerConfigStore {
    /// Store without persistence, for tests.
    pub fn in_memory() -> Self {
        Self {
            value: json!({}),
            metadata: ConfigMetadata::default(),
            file: None,
        }
    }

    pub fn load(opts: &ConfigOptions) -> Self {
        let value = std::fs::read_to_string(&opts.controller_config_file)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| json!({}));
        let metadata =
            ConfigMetadata::from_file(&opts.controller_config_metadata_file, false)
                .unwrap_or_else(|err| {
                    warn!(?err, "controller config metadata unavailable");
                    ConfigMetadata::default()
                });
        Self {
            value,
            metadata,
            file: Some(opts.controller_config_file.clone()),
        }
    }

    pub fn config_json(&self) -> String {
        canonical_json(&self.value)
    }

    pub fn metadata_json(&self) -> String {
        self.metadata.to_json()
    }

    /// Validate and persist a full replacement document. Returns the
    /// controller actions required by the changed keys.
    pub fn set_config(&mut self, config: &str) -> Result<BTreeSet<ConfigAction>> {
        let mut next: Value = serde_json::from_str(config).map_err(ConfigError::Json)?;
        if !next.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        prune_nulls(&mut next);

        let validation = self.metadata.validate(&next);
        if !validation.ok() {
            return Err(ConfigError::Validation(validation));
        }

        let changed = changed_paths(&self.value, &next);
        let actions = self
            .metadata
            .actions_for(changed.iter().map(String::as_str))
            .unwrap_or_else(|| BTreeSet::from([ConfigAction::NoAction]));

        if let Some(file) = &self.file {
            write_atomic(file, &canonical_json(&next)).map_err(ConfigError::Persist)?;
        }
        self.value = next;
        Ok(actions)
    }

    /// Adopt a replicated document from the active peer (no actions fire on
    /// the passive side).
    pub fn adopt_replicated(&mut self, config: &str) {
        match serde_json::from_str(config) {
            Ok(value) => self.value = value,
            Err(err) => warn!(?err, "malformed replicated controller config"),
        }
    }

    pub fn golden_image(&self) -> GoldenImagePolicy {
        self.value
            .get("upgradeParams")
            .and_then(|p| p.get("goldenImage"))
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Rewrite the golden-image policy in place (no validation: the policy
    /// structure is typed).
    pub fn set_golden_image(&mut self, policy: &GoldenImagePolicy) -> Result<()> {
        let Ok(policy_value) = serde_json::to_value(policy) else {
            return Err(ConfigError::NotAnObject);
        };
        let map = self.value.as_object_mut().ok_or(ConfigError::NotAnObject)?;
        let params = map
            .entry("upgradeParams".to_owned())
            .or_insert_with(|| json!({}));
        if let Some(params_map) = params.as_object_mut() {
            params_map.insert("goldenImage".to_owned(), policy_value);
        }
        if let Some(file) = &self.file {
            write_atomic(file, &canonical_json(&self.value)).map_err(ConfigError::Persist)?;
        }
        Ok(())
    }
}

/// Parse a `HH:MM-HH:MM` window and check whether `time` falls inside it.
/// Windows may wrap midnight. An empty restriction always passes; a
/// malformed one never does.
pub fn time_restriction_allows(restriction: &str, time: jiff::civil::Time) -> bool {
    if restriction.is_empty() {
        return true;
    }
    let Some((start, end)) = restriction.split_once('-') else {
        warn!(restriction, "malformed time restriction");
        return false;
    };
    let parse = |s: &str| -> Option<jiff::civil::Time> {
        let (h, m) = s.split_once(':')?;
        jiff::civil::Time::new(h.parse().ok()?, m.parse().ok()?, 0, 0).ok()
    };
    let (Some(start), Some(end)) = (parse(start), parse(end)) else {
        warn!(restriction, "malformed time restriction");
        return false;
    };
    if start <= end {
        time >= start && time <= end
    } else {
        time >= start || time <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::Time;

    #[test]
    fn golden_image_round_trip() {
        let mut store = ControllerConfigStore::in_memory();
        let mut policy = GoldenImagePolicy {
            enabled: true,
            batch_limit: 5,
            timeout_sec: 600,
            ..Default::default()
        };
        policy
            .versions
            .insert("MB1".to_owned(), "RELEASE_M46".to_owned());
        store.set_golden_image(&policy).unwrap();
        assert_eq!(store.golden_image(), policy);
    }

    #[test]
    fn set_config_reports_actions() {
        let mut store = ControllerConfigStore::in_memory();
        let actions = store.set_config(r#"{"flags": {"x": 1}}"#).unwrap();
        // no metadata loaded: falls back to a plain no-op action set
        assert!(actions.contains(&ConfigAction::NoAction));
        assert_eq!(
            store.config_json(),
            canonical_json(&json!({"flags": {"x": 1}}))
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        let mut store = ControllerConfigStore::in_memory();
        assert!(store.set_config("[1, 2]").is_err());
        assert!(store.set_config("{nope").is_err());
    }

    #[test]
    fn time_windows() {
        let t = |h, m| Time::new(h, m, 0, 0).unwrap();
        assert!(time_restriction_allows("", t(12, 0)));
        assert!(time_restriction_allows("01:00-05:00", t(3, 0)));
        assert!(!time_restriction_allows("01:00-05:00", t(12, 0)));
        // wrapping window
        assert!(time_restriction_allows("22:00-02:00", t(23, 30)));
        assert!(time_restriction_allows("22:00-02:00", t(1, 0)));
        assert!(!time_restriction_allows("22:00-02:00", t(12, 0)));
        assert!(!time_restriction_allows("garbage", t(12, 0)));
    }
}
