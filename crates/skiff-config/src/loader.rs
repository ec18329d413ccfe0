//! Config file discovery and layered loading.
//!
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/skiff/config.toml` (system)
//! 3. Merge `~/.skiff/config.toml` (user)
//! 4. Apply `SKIFF_*` fallbacks for fields no file set
//! 5. Deserialize, then validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge, record_leaves};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/skiff/config.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration plus where its values came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The merged configuration.
    pub config: Config,
    /// Which layer last set each field.
    pub field_sources: FieldSources,
    /// Config files that were found and merged, in merge order.
    pub loaded_files: Vec<String>,
}

/// Load the configuration with layered file precedence.
///
/// `home_override` replaces the `~/.skiff` directory used for the user
/// layer.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let user_dir = match home_override {
        Some(dir) => dir.to_path_buf(),
        None => home_directory()?.join(".skiff"),
    };
    load_layers(
        Path::new(SYSTEM_CONFIG_PATH),
        &user_dir.join("config.toml"),
        &collect_env_vars(),
    )
}

/// Load from explicit layer paths and environment.
///
/// # Errors
///
/// See [`load`].
pub fn load_layers<S: std::hash::BuildHasher>(
    system_path: &Path,
    user_path: &Path,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", ConfigLayer::Defaults, &mut field_sources);

    for (path, layer) in [(system_path, ConfigLayer::System), (user_path, ConfigLayer::User)] {
        if let Some(overlay) = try_load_file(path)? {
            deep_merge(&mut merged, &overlay, "", layer, &mut field_sources);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), layer = %layer, "loaded config");
        }
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a config from a single file (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Read and parse a file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config.bootstrap.reclaim_delay_ms, 1000);
        assert_eq!(config.bootstrap.platform_version, "128.0");
        assert_eq!(config.logging.level, "info");
        assert!(config.preferences.is_empty());
    }

    #[test]
    fn test_defaults_only() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = load_layers(
            &dir.path().join("system.toml"),
            &dir.path().join("user.toml"),
            &no_env(),
        )
        .unwrap();
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(
            resolved.field_sources.get("logging.format"),
            Some(&ConfigLayer::Defaults)
        );
    }

    #[test]
    fn test_user_overrides_system() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        std::fs::write(
            &system,
            "[bootstrap]\nreclaim_delay_ms = 200\nplatform_version = \"20.0\"\n\
             [preferences]\n\"extensions.modules.demo@skiff.path\" = \"file:///sys/\"",
        )
        .unwrap();
        std::fs::write(
            &user,
            "[bootstrap]\nreclaim_delay_ms = 10\n\
             [preferences]\n\"extensions.modules.demo@skiff.path.sdk\" = \"file:///me/\"",
        )
        .unwrap();

        let resolved = load_layers(&system, &user, &no_env()).unwrap();
        let config = &resolved.config;
        assert_eq!(config.bootstrap.reclaim_delay(), Duration::from_millis(10));
        assert_eq!(config.bootstrap.platform_version, "20.0");
        assert_eq!(config.preference_store().unwrap().len(), 2);
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(
            resolved.field_sources.get("bootstrap.reclaim_delay_ms"),
            Some(&ConfigLayer::User)
        );
        assert_eq!(
            resolved.field_sources.get("bootstrap.platform_version"),
            Some(&ConfigLayer::System)
        );
    }

    #[test]
    fn test_env_fallback_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<String, String> =
            [("SKIFF_LOG_FORMAT".to_owned(), "json".to_owned())].into();
        let resolved = load_layers(
            &dir.path().join("system.toml"),
            &dir.path().join("user.toml"),
            &env,
        )
        .unwrap();
        assert_eq!(resolved.config.logging.format, "json");

        let env: HashMap<String, String> =
            [("SKIFF_LOG_FORMAT".to_owned(), "xml".to_owned())].into();
        let err = load_layers(
            &dir.path().join("system.toml"),
            &dir.path().join("user.toml"),
            &env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        std::fs::write(&user, "[bootstrap\n").unwrap();
        let err = load_layers(&dir.path().join("none.toml"), &user, &no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        std::fs::write(&user, "[bootstrap]\nreclaim_delay_ms = \"soon\"").unwrap();
        let err = load_layers(&dir.path().join("none.toml"), &user, &no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }
}
