// src/flag.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
}

impl FeatureFlag {
    /// Validates a raw row from the flag table.
    ///
    /// Returns `None` unless `name` is a non-empty string and `enabled` is
    /// a JSON boolean. Numbers, strings like `"true"` and nulls are rejected.
    pub fn from_row(row: &Value) -> Option<FeatureFlag> {
        let name = row.get("name")?.as_str()?;
        if name.is_empty() {
            return None;
        }
        let enabled = row.get("enabled")?.as_bool()?;

        Some(FeatureFlag {
            name: name.to_string(),
            enabled,
        })
    }
}

/// Complete local view of every known flag at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    flags: HashMap<String, bool>,
}

impl FlagSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from raw rows, dropping malformed ones.
    pub fn from_rows(rows: &[Value]) -> Self {
        let mut flags = HashMap::with_capacity(rows.len());
        let mut dropped = 0usize;

        for row in rows {
            match FeatureFlag::from_row(row) {
                Some(flag) => {
                    flags.insert(flag.name, flag.enabled);
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            log::debug!("Dropped {} malformed flag rows", dropped);
        }

        Self { flags }
    }

    /// `true` only for names mapped to exactly `true`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.flags.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.flags.iter().map(|(name, enabled)| (name.as_str(), *enabled))
    }

    /// Sorted names of the flags that are switched on.
    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .flags
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Key-by-key comparison in both directions: keys added, keys removed
    /// and keys whose value changed all count as a difference.
    pub fn differs_from(&self, other: &FlagSnapshot) -> bool {
        let added_or_changed = self
            .flags
            .iter()
            .any(|(name, enabled)| other.flags.get(name) != Some(enabled));
        let removed = other
            .flags
            .keys()
            .any(|name| !self.flags.contains_key(name));

        added_or_changed || removed
    }
}

impl FromIterator<FeatureFlag> for FlagSnapshot {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        Self {
            flags: iter.into_iter().map(|f| (f.name, f.enabled)).collect(),
        }
    }
}
