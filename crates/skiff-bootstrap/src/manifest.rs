//! Package descriptor types and schema probing.
//!
//! A package ships one of two descriptor shapes:
//!
//! - **Legacy**: `harness-options.json`, a build-generated file holding the
//!   package id, the runner settings and a `metadata` table keyed by
//!   sub-package name (each with its own permissions and version).
//! - **Native**: a hand-written `package.json` (`id`, `name`, `version`,
//!   `prefs`, `main`) plus an optional `config.json` with runner settings.
//!
//! [`PackageManifest::probe`] tries the legacy file first and only falls
//! back to the native pair when it cannot be read or parsed. The result is a
//! tagged [`PackageManifest`]; nothing downstream probes files again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{BootstrapError, BootstrapResult};

/// Primary (legacy) descriptor file name.
pub const LEGACY_DESCRIPTOR: &str = "harness-options.json";

/// Secondary (native) descriptor file name.
pub const NATIVE_DESCRIPTOR: &str = "package.json";

/// Optional runner settings next to a native descriptor.
pub const NATIVE_CONFIG: &str = "config.json";

/// Suffix appended to native package names that carry no `@` domain.
pub const DEFAULT_ID_SUFFIX: &str = "@skiff";

/// Preferences file shipped by legacy packages, relative to the root.
pub const LEGACY_PREFS_PATH: &str = "defaults/preferences/prefs.json";

/// Maximum accepted descriptor size (4 MB).
const MAX_DESCRIPTOR_SIZE: u64 = 4 * 1024 * 1024;

/// Which descriptor schema a package uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestVariant {
    /// `harness-options.json`.
    Legacy,
    /// `package.json` + `config.json`.
    Native,
}

/// A package's permission set.
///
/// Shared and read-only: there is no API to mutate it once parsed, and the
/// package loader only ever receives a serialized copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<Map<String, Value>>", into = "Map<String, Value>")]
pub struct FrozenPermissions(Arc<Map<String, Value>>);

impl FrozenPermissions {
    /// Look up a single permission.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Iterate over all permissions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Whether no permissions are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Option<Map<String, Value>>> for FrozenPermissions {
    fn from(map: Option<Map<String, Value>>) -> Self {
        Self(Arc::new(map.unwrap_or_default()))
    }
}

impl From<FrozenPermissions> for Map<String, Value> {
    fn from(perms: FrozenPermissions) -> Self {
        Arc::unwrap_or_clone(perms.0)
    }
}

/// Settings for the package runner and the test harness.
///
/// Legacy packages carry these inline in `harness-options.json`; native
/// packages read them from `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSettings {
    /// Main module path.
    pub main_path: Option<String>,
    /// Whether the package ships its own copy of the runtime.
    #[serde(default, rename = "is-runtime-bundled")]
    pub is_runtime_bundled: bool,
    /// Force use of the bundled runtime regardless of platform version.
    #[serde(rename = "force-use-bundled-runtime")]
    pub force_bundled_runtime: Option<bool>,
    /// File the test runner writes `OK`/`FAIL` into.
    pub result_file: Option<String>,
    /// Arguments passed as static args.
    #[serde(default)]
    pub static_args: Value,
    /// Every test module in the package.
    #[serde(default)]
    pub all_test_modules: Value,
    /// Number of test iterations.
    pub iterations: Option<u32>,
    /// Test name filter.
    pub filter: Option<String>,
    /// Profile memory while testing.
    pub profile_memory: Option<bool>,
    /// Stop at the first failing test.
    pub stop_on_error: Option<bool>,
    /// Verbose test output.
    pub verbose: Option<bool>,
    /// Machine-readable test output.
    pub parseable: Option<bool>,
    /// Check for leaked memory after the run.
    #[serde(rename = "check_memory")]
    pub check_memory: Option<bool>,
}

/// Metadata declared for one sub-package of a legacy package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubPackageMetadata {
    /// Permission set, empty when absent.
    #[serde(default)]
    pub permissions: FrozenPermissions,
    /// Sub-package version.
    pub version: Option<String>,
    /// Everything else, kept for the package loader.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named sub-package of a legacy package.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPackage {
    /// Sub-package name (also its resource directory).
    pub name: String,
    /// Its declared metadata.
    pub metadata: SubPackageMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyOptions {
    package_id: String,
    name: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    manifest: Value,
    #[serde(flatten)]
    settings: RunnerSettings,
}

/// A package described by `harness-options.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyManifest {
    /// Package identifier (`packageId`).
    pub id: String,
    /// Name of the main sub-package.
    pub name: String,
    /// Declared sub-packages, in declaration order.
    pub sub_packages: Vec<SubPackage>,
    /// Module manifest produced by the build, passed through untouched.
    pub modules: Value,
    /// Runner settings.
    pub settings: RunnerSettings,
}

impl LegacyManifest {
    fn from_options(options: LegacyOptions, path: &Path) -> BootstrapResult<Self> {
        let sub_packages = options
            .metadata
            .into_iter()
            .map(|(name, value)| {
                serde_json::from_value(value)
                    .map(|metadata| SubPackage { name, metadata })
                    .map_err(|e| BootstrapError::ManifestParseError {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })
            })
            .collect::<BootstrapResult<Vec<_>>>()?;

        if !sub_packages.iter().any(|sub| sub.name == options.name) {
            return Err(BootstrapError::InvalidManifest(format!(
                "metadata has no entry for main package `{}`",
                options.name
            )));
        }

        Ok(Self {
            id: options.package_id,
            name: options.name,
            sub_packages,
            modules: options.manifest,
            settings: options.settings,
        })
    }

    /// Metadata of the main sub-package.
    #[must_use]
    pub fn main_metadata(&self) -> Option<&SubPackageMetadata> {
        self.sub_packages
            .iter()
            .find(|sub| sub.name == self.name)
            .map(|sub| &sub.metadata)
    }
}

/// The `package.json` block of a native package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    /// Explicit identifier.
    pub id: Option<String>,
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: Option<String>,
    /// Preferences file, relative to the package root.
    pub prefs: Option<String>,
    /// Main module.
    pub main: Option<String>,
    /// Everything else, passed through to the package loader.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A package described by `package.json` (+ `config.json`).
#[derive(Debug, Clone, PartialEq)]
pub struct NativeManifest {
    /// The parsed descriptor.
    pub descriptor: NativeDescriptor,
    /// Raw `config.json` contents (empty object when absent).
    pub config: Value,
    /// Runner settings read from `config.json`.
    pub settings: RunnerSettings,
}

impl NativeManifest {
    /// Package identifier: `id`, else `name` if it already carries an `@`
    /// domain, else `name` + [`DEFAULT_ID_SUFFIX`].
    #[must_use]
    pub fn id(&self) -> String {
        match &self.descriptor.id {
            Some(id) => id.clone(),
            None if self.descriptor.name.contains('@') => self.descriptor.name.clone(),
            None => format!("{}{DEFAULT_ID_SUFFIX}", self.descriptor.name),
        }
    }
}

/// A parsed package descriptor of either schema.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageManifest {
    /// `harness-options.json`.
    Legacy(LegacyManifest),
    /// `package.json` + `config.json`.
    Native(NativeManifest),
}

impl PackageManifest {
    /// Probe a package directory for its descriptor.
    ///
    /// # Errors
    ///
    /// A legacy descriptor that is missing or malformed is not an error; it
    /// only triggers the native fallback. Failure to read or parse
    /// `package.json`, or a malformed `config.json`, is returned.
    pub fn probe(dir: &Path) -> BootstrapResult<Self> {
        let legacy_path = dir.join(LEGACY_DESCRIPTOR);
        match read_json::<LegacyOptions>(&legacy_path) {
            Ok(options) => {
                debug!(path = %legacy_path.display(), "Using legacy package descriptor");
                return LegacyManifest::from_options(options, &legacy_path).map(Self::Legacy);
            },
            Err(e) => {
                debug!(
                    path = %legacy_path.display(),
                    error = %e,
                    "Legacy descriptor unavailable, falling back to native"
                );
            },
        }

        let native_path = dir.join(NATIVE_DESCRIPTOR);
        let descriptor: NativeDescriptor = read_json(&native_path)?;

        let config_path = dir.join(NATIVE_CONFIG);
        let config: Value = match read_json(&config_path) {
            Ok(config) => config,
            Err(BootstrapError::ReadError { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Value::Object(Map::new())
            },
            Err(e) => return Err(e),
        };
        let settings: RunnerSettings =
            serde_json::from_value(config.clone()).map_err(|e| {
                BootstrapError::ManifestParseError {
                    path: config_path.clone(),
                    message: e.to_string(),
                }
            })?;

        debug!(path = %native_path.display(), "Using native package descriptor");
        Ok(Self::Native(NativeManifest {
            descriptor,
            config,
            settings,
        }))
    }

    /// Which schema this package uses.
    #[must_use]
    pub fn variant(&self) -> ManifestVariant {
        match self {
            Self::Legacy(_) => ManifestVariant::Legacy,
            Self::Native(_) => ManifestVariant::Native,
        }
    }

    /// Whether this is a native package.
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }

    /// Package identifier.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Legacy(m) => m.id.clone(),
            Self::Native(m) => m.id(),
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Legacy(m) => &m.name,
            Self::Native(m) => &m.descriptor.name,
        }
    }

    /// Package version. Native packages fall back to `config.json`.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        match self {
            Self::Legacy(m) => m.main_metadata().and_then(|meta| meta.version.clone()),
            Self::Native(m) => m.descriptor.version.clone().or_else(|| {
                m.config
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            }),
        }
    }

    /// Declared sub-packages. Native packages declare none.
    #[must_use]
    pub fn sub_packages(&self) -> &[SubPackage] {
        match self {
            Self::Legacy(m) => &m.sub_packages,
            Self::Native(_) => &[],
        }
    }

    /// Permission set of the main package.
    #[must_use]
    pub fn permissions(&self) -> FrozenPermissions {
        match self {
            Self::Legacy(m) => m
                .main_metadata()
                .map(|meta| meta.permissions.clone())
                .unwrap_or_default(),
            Self::Native(m) => FrozenPermissions::from(
                m.descriptor
                    .extra
                    .get("permissions")
                    .and_then(Value::as_object)
                    .cloned(),
            ),
        }
    }

    /// Runner settings.
    #[must_use]
    pub fn settings(&self) -> &RunnerSettings {
        match self {
            Self::Legacy(m) => &m.settings,
            Self::Native(m) => &m.settings,
        }
    }

    /// The descriptor value handed to the package loader as `manifest`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the descriptor cannot be encoded.
    pub fn loader_manifest(&self) -> BootstrapResult<Value> {
        Ok(match self {
            Self::Legacy(m) => m.modules.clone(),
            Self::Native(m) => serde_json::to_value(&m.descriptor)?,
        })
    }

    /// The metadata value handed to the package loader: the main
    /// sub-package's metadata (legacy) or the config (native).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the metadata cannot be encoded.
    pub fn loader_metadata(&self) -> BootstrapResult<Value> {
        Ok(match self {
            Self::Legacy(m) => serde_json::to_value(m.main_metadata().cloned().unwrap_or_default())?,
            Self::Native(m) => {
                let mut config = m.config.clone();
                if let Value::Object(map) = &mut config {
                    map.insert(
                        "permissions".to_owned(),
                        serde_json::to_value(self.permissions())?,
                    );
                }
                config
            },
        })
    }

    /// Main module: the runner's `mainPath`, else the native `main` field.
    #[must_use]
    pub fn main(&self) -> Option<String> {
        let settings = self.settings().main_path.clone();
        match self {
            Self::Legacy(_) => settings,
            Self::Native(m) => settings.or_else(|| m.descriptor.main.clone()),
        }
    }

    /// Preferences file relative to the package root, if any.
    #[must_use]
    pub fn prefs_path(&self) -> Option<String> {
        match self {
            Self::Legacy(_) => Some(LEGACY_PREFS_PATH.to_owned()),
            Self::Native(m) => m.descriptor.prefs.clone(),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> BootstrapResult<T> {
    let read_error = |e: std::io::Error| BootstrapError::ReadError {
        path: path.to_path_buf(),
        source: e,
    };
    let size = std::fs::metadata(path).map_err(read_error)?.len();
    if size > MAX_DESCRIPTOR_SIZE {
        return Err(BootstrapError::ManifestParseError {
            path: path.to_path_buf(),
            message: format!(
                "descriptor is {size} bytes, exceeding the {MAX_DESCRIPTOR_SIZE} byte limit"
            ),
        });
    }
    let content = std::fs::read_to_string(path).map_err(read_error)?;
    serde_json::from_str(&content).map_err(|e| BootstrapError::ManifestParseError {
        path: PathBuf::from(path),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const LEGACY: &str = r#"{
        "packageId": "hello@example.org",
        "name": "hello",
        "mainPath": "hello/main",
        "resultFile": "/tmp/result",
        "metadata": {
            "hello": { "permissions": { "private-browsing": true }, "version": "1.2.0" },
            "widgets": { "version": "0.3.0" }
        },
        "manifest": { "hello/main": { "requirements": {} } }
    }"#;

    #[test]
    fn test_probe_prefers_legacy() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEGACY_DESCRIPTOR), LEGACY).unwrap();
        fs::write(dir.path().join(NATIVE_DESCRIPTOR), r#"{"name": "other"}"#).unwrap();

        let manifest = PackageManifest::probe(dir.path()).unwrap();
        assert_eq!(manifest.variant(), ManifestVariant::Legacy);
        assert_eq!(manifest.id(), "hello@example.org");
        assert_eq!(manifest.name(), "hello");
        assert_eq!(manifest.version().as_deref(), Some("1.2.0"));
        assert_eq!(manifest.main().as_deref(), Some("hello/main"));
        assert_eq!(
            manifest.permissions().get("private-browsing"),
            Some(&Value::Bool(true))
        );
        let names: Vec<_> = manifest.sub_packages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["hello", "widgets"]);
    }

    #[test]
    fn test_missing_permissions_default_to_empty() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(LEGACY_DESCRIPTOR),
            r#"{"packageId": "a@b", "name": "a", "metadata": {"a": {"permissions": null}}}"#,
        )
        .unwrap();
        let manifest = PackageManifest::probe(dir.path()).unwrap();
        assert!(manifest.permissions().is_empty());
    }

    #[test]
    fn test_legacy_without_main_metadata_is_invalid() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(LEGACY_DESCRIPTOR),
            r#"{"packageId": "a@b", "name": "a", "metadata": {}}"#,
        )
        .unwrap();
        let err = PackageManifest::probe(dir.path()).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidManifest(_)));
    }

    #[test]
    fn test_malformed_legacy_falls_back_to_native() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEGACY_DESCRIPTOR), "{ not json").unwrap();
        fs::write(
            dir.path().join(NATIVE_DESCRIPTOR),
            r#"{"name": "native-pkg", "version": "2.0.0", "prefs": "prefs.json"}"#,
        )
        .unwrap();

        let manifest = PackageManifest::probe(dir.path()).unwrap();
        assert!(manifest.is_native());
        assert_eq!(manifest.id(), "native-pkg@skiff");
        assert_eq!(manifest.prefs_path().as_deref(), Some("prefs.json"));
        assert_eq!(manifest.settings(), &RunnerSettings::default());
    }

    #[test]
    fn test_native_id_rules() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(NATIVE_DESCRIPTOR), r#"{"name": "x@corp"}"#).unwrap();
        assert_eq!(PackageManifest::probe(dir.path()).unwrap().id(), "x@corp");

        fs::write(
            dir.path().join(NATIVE_DESCRIPTOR),
            r#"{"id": "explicit@corp", "name": "x"}"#,
        )
        .unwrap();
        assert_eq!(PackageManifest::probe(dir.path()).unwrap().id(), "explicit@corp");
    }

    #[test]
    fn test_native_reads_config() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(NATIVE_DESCRIPTOR), r#"{"name": "x"}"#).unwrap();
        fs::write(
            dir.path().join(NATIVE_CONFIG),
            r#"{"version": "9.9", "iterations": 3, "filter": "io"}"#,
        )
        .unwrap();
        let manifest = PackageManifest::probe(dir.path()).unwrap();
        assert_eq!(manifest.version().as_deref(), Some("9.9"));
        assert_eq!(manifest.settings().iterations, Some(3));
        assert_eq!(manifest.settings().filter.as_deref(), Some("io"));
    }

    #[test]
    fn test_fallback_failure_propagates() {
        let dir = tempdir().unwrap();
        let err = PackageManifest::probe(dir.path()).unwrap_err();
        assert!(matches!(err, BootstrapError::ReadError { .. }));

        fs::write(dir.path().join(NATIVE_DESCRIPTOR), "[]").unwrap();
        let err = PackageManifest::probe(dir.path()).unwrap_err();
        assert!(matches!(err, BootstrapError::ManifestParseError { .. }));
    }

    #[test]
    fn test_oversized_descriptor_rejected_before_read() {
        let dir = tempdir().unwrap();
        let file = fs::File::create(dir.path().join(NATIVE_DESCRIPTOR)).unwrap();
        file.set_len(MAX_DESCRIPTOR_SIZE + 1).unwrap();

        let err = PackageManifest::probe(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ManifestParseError { ref message, .. } if message.contains("byte limit")
        ));
    }

    #[test]
    fn test_malformed_native_config_propagates() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(NATIVE_DESCRIPTOR), r#"{"name": "x"}"#).unwrap();
        fs::write(dir.path().join(NATIVE_CONFIG), "nope").unwrap();
        assert!(PackageManifest::probe(dir.path()).is_err());
    }
}
