//! On-disk package and platform fixtures.
//!
//! Fixtures live in temporary directories removed on drop. Helpers panic on
//! I/O failure; they are only meant for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use url::Url;

use skiff_bootstrap::controller::DEFAULT_RECLAIM_DELAY;
use skiff_bootstrap::{
    ActivationData, HostEnvironment, LifecycleController, LoadReason, MemoryPreferences,
    PlatformVersion,
};

use crate::mocks::{MockBackend, MockProgram};

/// Platform version used by fixtures unless told otherwise.
pub const TEST_PLATFORM_VERSION: &str = "128.0";

fn write_file(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture directory");
    }
    std::fs::write(&path, contents).expect("write fixture file");
    path
}

fn dir_url(path: &Path) -> Url {
    Url::from_directory_path(path).expect("fixture path is absolute")
}

/// A platform install whose `modules/` tree holds both loader entries.
#[derive(Debug)]
pub struct PlatformFixture {
    dir: TempDir,
}

impl PlatformFixture {
    /// Create a platform whose native and legacy loader entries both run
    /// `loader`.
    #[must_use]
    pub fn new(loader: &MockProgram) -> Self {
        let fixture = Self {
            dir: TempDir::new().expect("create platform fixture"),
        };
        fixture.write_program("modules/toolkit/loader.wasm", loader);
        fixture.write_program("modules/sdk/loader/bridge.wasm", loader);
        fixture
    }

    /// Filesystem root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `file://` URL of the root, the target of `resource://platform/`.
    #[must_use]
    pub fn root_url(&self) -> Url {
        dir_url(self.dir.path())
    }

    /// `file://` URL of a file below the root.
    #[must_use]
    pub fn file_url(&self, rel: &str) -> Url {
        self.root_url().join(rel).expect("relative fixture path")
    }

    /// Write raw bytes below the root.
    pub fn write(&self, rel: &str, contents: &[u8]) -> PathBuf {
        write_file(self.dir.path(), rel, contents)
    }

    /// Write a mock program below the root.
    pub fn write_program(&self, rel: &str, program: &MockProgram) -> PathBuf {
        self.write(rel, &program.to_bytes())
    }

    /// A host environment running `backend` against this platform.
    #[must_use]
    pub fn host(&self, backend: &MockBackend) -> HostEnvironment {
        self.host_with(backend, MemoryPreferences::new(), TEST_PLATFORM_VERSION)
    }

    /// A host environment with explicit preferences and platform version.
    #[must_use]
    pub fn host_with(
        &self,
        backend: &MockBackend,
        prefs: MemoryPreferences,
        version: &str,
    ) -> HostEnvironment {
        let version: PlatformVersion = version.parse().expect("valid platform version");
        HostEnvironment::new(Arc::new(backend.clone()), version)
            .with_preferences(Arc::new(prefs))
            .with_reclaim_delay(DEFAULT_RECLAIM_DELAY)
            .with_platform_root(self.root_url())
    }

    /// A controller over [`host`](Self::host).
    #[must_use]
    pub fn controller(&self, backend: &MockBackend) -> LifecycleController {
        LifecycleController::new(self.host(backend))
    }

    /// A controller with a custom reclaim delay.
    #[must_use]
    pub fn controller_with_delay(
        &self,
        backend: &MockBackend,
        delay: Duration,
    ) -> LifecycleController {
        LifecycleController::new(self.host(backend).with_reclaim_delay(delay))
    }
}

/// An installed package directory.
#[derive(Debug)]
pub struct PackageFixture {
    dir: TempDir,
}

impl PackageFixture {
    fn empty() -> Self {
        Self {
            dir: TempDir::new().expect("create package fixture"),
        }
    }

    /// A native package with a bare `package.json`.
    #[must_use]
    pub fn native(name: &str) -> Self {
        Self::native_with(&json!({ "name": name }))
    }

    /// A native package with the given `package.json`.
    #[must_use]
    pub fn native_with(descriptor: &Value) -> Self {
        let fixture = Self::empty();
        fixture.write_json("package.json", descriptor);
        fixture
    }

    /// A legacy package whose only sub-package is its main one.
    #[must_use]
    pub fn legacy(id: &str, name: &str) -> Self {
        Self::legacy_with(&json!({
            "packageId": id,
            "name": name,
            "metadata": { name: { "permissions": {} } },
            "manifest": {},
        }))
    }

    /// A legacy package with the given `harness-options.json`.
    #[must_use]
    pub fn legacy_with(options: &Value) -> Self {
        let fixture = Self::empty();
        fixture.write_json("harness-options.json", options);
        fixture
    }

    /// Add a `config.json`.
    #[must_use]
    pub fn with_config(self, config: &Value) -> Self {
        self.write_json("config.json", config);
        self
    }

    /// Filesystem root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `file://` URL of the root.
    #[must_use]
    pub fn root_url(&self) -> Url {
        dir_url(self.dir.path())
    }

    /// Activation data for this package.
    #[must_use]
    pub fn activation(&self, reason: LoadReason) -> ActivationData {
        ActivationData::new(self.root_url(), reason)
    }

    /// Write raw bytes below the root.
    pub fn write(&self, rel: &str, contents: &[u8]) -> PathBuf {
        write_file(self.dir.path(), rel, contents)
    }

    /// Write a JSON value below the root.
    pub fn write_json(&self, rel: &str, value: &Value) -> PathBuf {
        let bytes = serde_json::to_vec_pretty(value).expect("serialize fixture JSON");
        self.write(rel, &bytes)
    }

    /// Write a mock program below the root.
    pub fn write_program(&self, rel: &str, program: &MockProgram) -> PathBuf {
        self.write(rel, &program.to_bytes())
    }
}
