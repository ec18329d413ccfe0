//! Options handed across the sandbox boundary to the package loader.
//!
//! [`ResolvedOptions`] is built once per activation and only ever crosses
//! into the loader's context in serialized form, so the loader cannot
//! mutate the controller's copy.

use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::BootstrapResult;
use crate::manifest::PackageManifest;
use crate::paths::PathMapping;
use crate::reason::LoadReason;
use crate::sandbox::ContextId;

/// Module id under which the loader exposes the test options.
pub const TEST_OPTIONS_MODULE: &str = "@test/options";

/// Test-runner configuration exposed to packages as `@test/options`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOptions {
    /// Every test module in the package.
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
    pub check_memory: Option<bool>,
    /// The package's path mapping.
    pub paths: PathMapping,
}

/// Reference to the exports of a context, as seen from inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportsRef {
    /// Context id, e.g. `ctx-1.0`.
    pub context: String,
}

impl From<ContextId> for ExportsRef {
    fn from(id: ContextId) -> Self {
        Self {
            context: id.to_string(),
        }
    }
}

/// Modules preloaded into the package loader's cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadedModules {
    /// `@test/options`.
    #[serde(rename = "@test/options")]
    pub test_options: TestOptions,
    /// `toolkit/loader`: the native loader's own bootstrap context.
    #[serde(rename = "toolkit/loader", skip_serializing_if = "Option::is_none")]
    pub loader: Option<ExportsRef>,
}

/// Aggregate configuration for the package loader.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOptions {
    /// Native (`package.json`) package.
    pub is_native: bool,
    /// Prefix → location mapping.
    pub paths: PathMapping,
    /// Module manifest (legacy) or descriptor (native).
    pub manifest: Value,
    /// Package identifier.
    pub id: String,
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: Option<String>,
    /// Package metadata, including the permission set.
    pub metadata: Value,
    /// Why the package is being loaded.
    pub load_reason: LoadReason,
    /// `resource://<domain>/`.
    #[serde(rename = "prefixURI")]
    pub prefix_uri: Url,
    /// Package root: the source root for native packages, the install
    /// root otherwise.
    #[serde(rename = "rootURI")]
    pub root_uri: Url,
    /// File the test runner writes its result into.
    pub result_file: Option<String>,
    /// Static arguments.
    pub static_args: Value,
    /// Preloaded modules.
    pub modules: PreloadedModules,
}

impl ResolvedOptions {
    /// Assemble the options for one activation. `loader` is the bootstrap
    /// context running the package loader.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the manifest or metadata cannot be
    /// encoded.
    pub fn build(
        manifest: &PackageManifest,
        paths: PathMapping,
        reason: LoadReason,
        prefix_uri: Url,
        install_root: &Url,
        loader: ContextId,
    ) -> BootstrapResult<Self> {
        let settings = manifest.settings();
        let root_uri = if manifest.is_native() {
            prefix_uri.clone()
        } else {
            install_root.clone()
        };

        Ok(Self {
            is_native: manifest.is_native(),
            manifest: manifest.loader_manifest()?,
            id: manifest.id(),
            name: manifest.name().to_owned(),
            version: manifest.version(),
            metadata: manifest.loader_metadata()?,
            load_reason: reason,
            prefix_uri,
            root_uri,
            result_file: settings.result_file.clone(),
            static_args: settings.static_args.clone(),
            modules: PreloadedModules {
                test_options: TestOptions {
                    all_test_modules: settings.all_test_modules.clone(),
                    iterations: settings.iterations,
                    filter: settings.filter.clone(),
                    profile_memory: settings.profile_memory,
                    stop_on_error: settings.stop_on_error,
                    verbose: settings.verbose,
                    parseable: settings.parseable,
                    check_memory: settings.check_memory,
                    paths: paths.clone(),
                },
                loader: manifest.is_native().then(|| ExportsRef::from(loader)),
            },
            paths,
        })
    }
}

/// Payload of the loader's `startup` export.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupRequest<'a> {
    /// Load reason.
    pub reason: LoadReason,
    /// Resolved options.
    pub options: &'a ResolvedOptions,
    /// Main module, if declared.
    pub main: Option<&'a str>,
    /// Package preferences file.
    #[serde(rename = "prefsURI")]
    pub prefs_uri: Option<&'a Url>,
}

/// Payload of the loader's `unload` export.
#[derive(Debug, Serialize)]
pub struct UnloadRequest {
    /// Unload reason.
    pub reason: LoadReason,
}
