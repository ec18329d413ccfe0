//! The package loader: the bootstrap context hosting a package.
//!
//! The loader is an ordinary context with two exports, `startup` and
//! `unload`, each taking a JSON request. Where its entry module lives
//! depends on the manifest schema and on how the path mapping was built.

use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{BootstrapError, BootstrapResult};
use crate::manifest::PackageManifest;
use crate::options::{ResolvedOptions, StartupRequest, UnloadRequest};
use crate::paths::{PathMapping, SHARED_PREFIX};
use crate::reason::LoadReason;
use crate::sandbox::{ContextId, ContextLoader, LoadedContext};

/// Export run once the loader is instantiated.
pub const STARTUP_EXPORT: &str = "startup";

/// Export run on deactivation.
pub const UNLOAD_EXPORT: &str = "unload";

/// Loader entry of native packages, relative to the shared root.
pub const NATIVE_LOADER_ENTRY: &str = "toolkit/loader.wasm";

/// Loader entry of legacy packages, relative to the shared root.
pub const LEGACY_LOADER_ENTRY: &str = "sdk/loader/bridge.wasm";

/// Prefix whose override relocates the loader entry.
pub const SDK_PREFIX: &str = "sdk/";

/// Location of the loader entry module for `manifest`.
///
/// A mapped `sdk/` prefix wins (the entry sits next to it); otherwise the
/// entry is looked up under the shared prefix.
///
/// # Errors
///
/// Returns [`BootstrapError::InvalidLocation`] if neither prefix is mapped
/// or the entry cannot be joined onto it.
pub fn loader_entry(manifest: &PackageManifest, paths: &PathMapping) -> BootstrapResult<Url> {
    let (base, rel) = match paths.get(SDK_PREFIX) {
        Some(sdk) if manifest.is_native() => (sdk, format!("../{NATIVE_LOADER_ENTRY}")),
        Some(sdk) => (sdk, "loader/bridge.wasm".to_owned()),
        None => {
            let shared = paths
                .get(SHARED_PREFIX)
                .ok_or_else(|| BootstrapError::InvalidLocation {
                    location: String::new(),
                    message: "path mapping has no shared root".to_owned(),
                })?;
            let rel = if manifest.is_native() {
                NATIVE_LOADER_ENTRY
            } else {
                LEGACY_LOADER_ENTRY
            };
            (shared, rel.to_owned())
        },
    };
    base.join(&rel).map_err(|e| BootstrapError::InvalidLocation {
        location: format!("{base}{rel}"),
        message: e.to_string(),
    })
}

/// Typed handle on the loader context of one activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLoader {
    loaded: LoadedContext,
    entry: Url,
}

impl PackageLoader {
    /// Boot the loader entry at `entry` in a fresh bootstrap context.
    ///
    /// # Errors
    ///
    /// Returns the load error of the context.
    pub fn boot(loader: &ContextLoader, entry: Url) -> BootstrapResult<Self> {
        let loaded = loader.load(&entry)?;
        debug!(context = %loaded.id, entry = %entry, "Booted package loader");
        Ok(Self { loaded, entry })
    }

    /// The loader's context.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.loaded.id
    }

    /// Where the loader was loaded from.
    #[must_use]
    pub fn entry(&self) -> &Url {
        &self.entry
    }

    /// Run `startup`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, including a missing export.
    pub fn start(
        &self,
        loader: &ContextLoader,
        reason: LoadReason,
        options: &ResolvedOptions,
        main: Option<&str>,
        prefs_uri: Option<&Url>,
    ) -> BootstrapResult<()> {
        let request = StartupRequest {
            reason,
            options,
            main,
            prefs_uri,
        };
        self.call(loader, STARTUP_EXPORT, &request)
    }

    /// Run `unload`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, including a missing export.
    pub fn unload(&self, loader: &ContextLoader, reason: LoadReason) -> BootstrapResult<()> {
        self.call(loader, UNLOAD_EXPORT, &UnloadRequest { reason })
    }

    fn call<T: Serialize>(
        &self,
        loader: &ContextLoader,
        export: &str,
        request: &T,
    ) -> BootstrapResult<()> {
        let input = serde_json::to_vec(request)?;
        loader.invoke(&self.loaded.exports, export, &input)?;
        Ok(())
    }
}
