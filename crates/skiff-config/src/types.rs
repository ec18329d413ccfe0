//! Configuration types for the Skiff runtime.
//!
//! Every struct implements [`Default`] matching `defaults.toml`, so a bare
//! `[section]` header produces a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_bootstrap::{MemoryPreferences, PrefValue};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the Skiff runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Package bootstrap settings.
    pub bootstrap: BootstrapSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
    /// Host preferences visible to packages, keyed by dotted name.
    pub preferences: toml::Table,
}

impl Config {
    /// Flatten `[preferences]` into a preference snapshot.
    ///
    /// Quoted keys (`"a.b.c" = 1`) and nested tables (`a.b.c = 1`) both
    /// produce the key `a.b.c`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPreference`] for floats, arrays and
    /// datetimes, which have no preference equivalent.
    pub fn preference_store(&self) -> ConfigResult<MemoryPreferences> {
        let mut prefs = MemoryPreferences::new();
        flatten_preferences(&self.preferences, "", &mut prefs)?;
        Ok(prefs)
    }
}

fn flatten_preferences(
    table: &toml::Table,
    prefix: &str,
    prefs: &mut MemoryPreferences,
) -> ConfigResult<()> {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let pref = match value {
            toml::Value::Table(child) => {
                flatten_preferences(child, &path, prefs)?;
                continue;
            },
            toml::Value::String(s) => PrefValue::String(s.clone()),
            toml::Value::Boolean(b) => PrefValue::Bool(*b),
            toml::Value::Integer(i) => PrefValue::Int(*i),
            other => {
                return Err(ConfigError::InvalidPreference {
                    key: path,
                    message: format!(
                        "{} values are not supported; use a string, boolean or integer",
                        other.type_str()
                    ),
                });
            },
        };
        prefs.set(path, pref);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// BootstrapSection
// ---------------------------------------------------------------------------

/// Package bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// Milliseconds between deactivation and forced reclaim.
    pub reclaim_delay_ms: u64,
    /// Host platform version, e.g. `"128.0"` or `"21.0a1"`.
    pub platform_version: String,
    /// Directory containing the platform's `modules/` tree, the target of
    /// `resource://platform/`.
    pub platform_root: Option<PathBuf>,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            reclaim_delay_ms: 1000,
            platform_version: "128.0".to_owned(),
            platform_root: None,
        }
    }
}

impl BootstrapSection {
    /// Reclaim delay as a [`Duration`].
    #[must_use]
    pub fn reclaim_delay(&self) -> Duration {
        Duration::from_millis(self.reclaim_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["skiff_bootstrap=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
