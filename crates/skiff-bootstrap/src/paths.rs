//! Prefix → location mapping handed to the package loader.
//!
//! The mapping is built in layers, each later layer replacing entries of
//! the earlier ones:
//!
//! 1. defaults (package source root, test root, platform module root),
//! 2. one `lib`/`tests` pair per legacy sub-package,
//! 3. the bundled runtime, when the platform predates
//!    [`BUNDLED_RUNTIME_CUTOFF`](crate::version::BUNDLED_RUNTIME_CUTOFF) or
//!    bundling is forced,
//! 4. preference overrides under `extensions.modules.<id>.path`.

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{debug, warn};
use url::Url;

use crate::alias::{AliasRegistry, PLATFORM_DOMAIN, override_alias_prefix, resource_root};
use crate::error::{BootstrapError, BootstrapResult};
use crate::manifest::PackageManifest;
use crate::prefs::PreferenceStore;
use crate::version::PlatformVersion;

/// Prefix relative module ids resolve against.
pub const ROOT_PREFIX: &str = "./";

/// Prefix of the package's own tests.
pub const TESTS_PREFIX: &str = "./tests/";

/// Fallback prefix: the shared module root.
pub const SHARED_PREFIX: &str = "";

/// Reserved entry naming the runtime's test driver module.
pub const RUNTIME_ENTRY: &str = "runtime";

/// Name of the runtime package some packages ship inside themselves.
pub const RUNTIME_PACKAGE_NAME: &str = "skiff-runtime";

/// Boolean preference forcing the bundled runtime.
pub const USE_BUNDLED_RUNTIME_PREF: &str = "extensions.skiff-runtime.useBundledRuntime";

/// An ordered prefix → base location table.
///
/// Inserting an existing prefix replaces its location in place, so the
/// order of entries reflects when each prefix was first declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMapping {
    entries: Vec<(String, Url)>,
}

impl PathMapping {
    /// Create an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `prefix` to `location`, returning the location it replaced.
    pub fn insert(&mut self, prefix: impl Into<String>, location: Url) -> Option<Url> {
        let prefix = prefix.into();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(p, _)| *p == prefix) {
            return Some(std::mem::replace(existing, location));
        }
        self.entries.push((prefix, location));
        None
    }

    /// Location mapped to exactly `prefix`.
    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<&Url> {
        self.entries
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, location)| location)
    }

    /// Whether `prefix` is mapped.
    #[must_use]
    pub fn contains(&self, prefix: &str) -> bool {
        self.get(prefix).is_some()
    }

    /// Resolve a module id against the longest matching prefix.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Url> {
        let (prefix, base) = self
            .entries
            .iter()
            .filter(|(p, _)| id.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())?;
        base.join(&id[prefix.len()..]).ok()
    }

    /// Iterate over entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Url)> {
        self.entries.iter().map(|(p, l)| (p.as_str(), l))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PathMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (prefix, location) in &self.entries {
            map.serialize_entry(prefix, location.as_str())?;
        }
        map.end()
    }
}

/// Builds the [`PathMapping`] for a package.
pub struct PathResolver<'a> {
    prefs: &'a dyn PreferenceStore,
    aliases: &'a AliasRegistry,
    platform_version: &'a PlatformVersion,
}

impl<'a> PathResolver<'a> {
    /// Create a resolver over the host's preferences and alias registry.
    #[must_use]
    pub fn new(
        prefs: &'a dyn PreferenceStore,
        aliases: &'a AliasRegistry,
        platform_version: &'a PlatformVersion,
    ) -> Self {
        Self {
            prefs,
            aliases,
            platform_version,
        }
    }

    /// Whether the package should use its bundled runtime.
    #[must_use]
    pub fn use_bundled_runtime(&self, manifest: &PackageManifest) -> bool {
        let forced = manifest.settings().force_bundled_runtime == Some(true)
            || self.prefs.get_bool(USE_BUNDLED_RUNTIME_PREF) == Some(true);
        forced || self.platform_version.needs_bundled_runtime()
    }

    /// Build the mapping for `manifest`, whose alias domain is `domain`.
    ///
    /// Preference overrides are registered as aliases as a side effect.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::InvalidLocation`] if a package location
    /// cannot be formed from the domain or sub-package names.
    pub fn resolve(&self, manifest: &PackageManifest, domain: &str) -> BootstrapResult<PathMapping> {
        let prefix = resource_root(domain)?;
        let name = manifest.name();
        let mut paths = PathMapping::new();

        // 1. Defaults.
        if manifest.is_native() {
            paths.insert(ROOT_PREFIX, prefix.clone());
            paths.insert(TESTS_PREFIX, prefix.clone());
        } else {
            paths.insert(ROOT_PREFIX, join(&prefix, &format!("{name}/lib/"))?);
            paths.insert(TESTS_PREFIX, join(&prefix, &format!("{name}/tests/"))?);
        }
        paths.insert(SHARED_PREFIX, platform_modules_root()?);

        // 2. Legacy sub-packages.
        for sub in manifest.sub_packages() {
            let sub_name = &sub.name;
            paths.insert(format!("{sub_name}/"), join(&prefix, &format!("{sub_name}/lib/"))?);
            paths.insert(
                format!("{sub_name}/tests/"),
                join(&prefix, &format!("{sub_name}/tests/"))?,
            );
        }

        // The runtime's own tests are addressed without their package name.
        if name == RUNTIME_PACKAGE_NAME {
            paths.insert("tests/", join(&prefix, &format!("{name}/tests/"))?);
        }

        // 3. Bundled runtime.
        if self.use_bundled_runtime(manifest) {
            if !manifest.settings().is_runtime_bundled {
                warn!(
                    package = name,
                    "Using bundled runtime but the package does not declare one"
                );
            }
            paths.insert(
                SHARED_PREFIX,
                join(&prefix, &format!("{RUNTIME_PACKAGE_NAME}/lib/"))?,
            );
            paths.insert(
                RUNTIME_ENTRY,
                join(&prefix, &format!("{RUNTIME_PACKAGE_NAME}/lib/sdk/runtime.wasm"))?,
            );
        }

        // 4. Preference overrides.
        self.apply_overrides(&manifest.id(), domain, &mut paths);

        debug!(package = name, entries = paths.len(), "Resolved path mapping");
        Ok(paths)
    }

    fn apply_overrides(&self, id: &str, domain: &str, paths: &mut PathMapping) {
        let branch = format!("extensions.modules.{id}.path");
        for child in self.prefs.child_list(&branch) {
            let key = format!("{branch}{child}");
            let Some(prefix) = override_prefix(&child) else {
                debug!(key = %key, "Ignoring malformed path override key");
                continue;
            };
            let Some(mut raw) = self.prefs.get_string(&key) else {
                debug!(key = %key, "Ignoring non-string path override");
                continue;
            };
            if raw.trim().is_empty() {
                warn!(key = %key, "Ignoring empty path override");
                continue;
            }
            if !raw.ends_with('/') {
                raw.push('/');
            }
            let target = match Url::parse(&raw) {
                Ok(target) => target,
                Err(e) => {
                    warn!(key = %key, value = %raw, error = %e, "Ignoring unparsable path override");
                    continue;
                },
            };

            let alias = format!("{}{child}", override_alias_prefix(domain));
            let location = match resource_root(&alias) {
                Ok(location) => location,
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring path override with unusable alias");
                    continue;
                },
            };
            self.aliases.set_substitution(alias, target);
            debug!(prefix = %prefix, location = %location, "Applied path override");
            paths.insert(prefix, location);
        }
    }
}

/// The platform's shared module root, `resource://platform/modules/`.
///
/// # Errors
///
/// Never fails in practice; returns [`BootstrapError::InvalidLocation`] if
/// the constant root cannot be parsed.
pub fn platform_modules_root() -> BootstrapResult<Url> {
    join(&resource_root(PLATFORM_DOMAIN)?, "modules/")
}

/// Turn a branch child name into a mapping prefix.
///
/// The empty name is the root override (`""`); otherwise the name must be
/// `.` followed by non-empty dot-separated segments, which become
/// `seg/seg/`.
fn override_prefix(child: &str) -> Option<String> {
    if child.is_empty() {
        return Some(String::new());
    }
    let rest = child.strip_prefix('.')?;
    let segments: Vec<&str> = rest.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(format!("{}/", segments.join("/")))
}

fn join(base: &Url, rel: &str) -> BootstrapResult<Url> {
    base.join(rel).map_err(|e| BootstrapError::InvalidLocation {
        location: format!("{base}{rel}"),
        message: e.to_string(),
    })
}
