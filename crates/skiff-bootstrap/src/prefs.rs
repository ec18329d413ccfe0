//! Preference store seen by the path resolver.
//!
//! Preferences are flat dotted keys (`extensions.modules.<id>.path.sdk`)
//! holding string, boolean or integer values. Branch enumeration is always
//! in sorted key order so resolution never depends on insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single preference value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    /// Boolean preference.
    Bool(bool),
    /// Integer preference.
    Int(i64),
    /// String preference.
    String(String),
}

/// Read access to the host's preferences.
pub trait PreferenceStore: Send + Sync {
    /// Look up a single preference.
    fn get(&self, key: &str) -> Option<PrefValue>;

    /// Names of every preference whose key starts with `branch`, relative
    /// to the branch and in sorted order. The branch key itself, if set,
    /// is reported as the empty name.
    fn child_list(&self, branch: &str) -> Vec<String>;

    /// Look up a boolean preference. Other value types read as `None`.
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(PrefValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    /// Look up a string preference. Other value types read as `None`.
    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(PrefValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// In-memory preference snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryPreferences {
    values: BTreeMap<String, PrefValue>,
}

impl MemoryPreferences {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a preference, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: PrefValue) {
        self.values.insert(key.into(), value);
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: PrefValue) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a preference.
    pub fn remove(&mut self, key: &str) -> Option<PrefValue> {
        self.values.remove(key)
    }

    /// Number of preferences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, PrefValue)> for MemoryPreferences {
    fn from_iter<I: IntoIterator<Item = (String, PrefValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<PrefValue> {
        self.values.get(key).cloned()
    }

    fn child_list(&self, branch: &str) -> Vec<String> {
        self.values
            .range(branch.to_owned()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(branch))
            .map(|key| key[branch.len()..].to_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_list_is_sorted_and_relative() {
        let prefs = MemoryPreferences::new()
            .with("a.b.path.zeta", PrefValue::String("z".into()))
            .with("a.b.path", PrefValue::String("root".into()))
            .with("a.b.path.alpha", PrefValue::String("a".into()))
            .with("a.c", PrefValue::Bool(true));

        assert_eq!(prefs.child_list("a.b.path"), vec!["", ".alpha", ".zeta"]);
        assert!(prefs.child_list("x").is_empty());
    }

    #[test]
    fn test_typed_getters() {
        let prefs = MemoryPreferences::new()
            .with("flag", PrefValue::Bool(true))
            .with("name", PrefValue::String("x".into()));
        assert_eq!(prefs.get_bool("flag"), Some(true));
        assert_eq!(prefs.get_bool("name"), None);
        assert_eq!(prefs.get_string("name").as_deref(), Some("x"));
        assert_eq!(prefs.get_string("missing"), None);
    }
}
