//! Lifecycle controller: the single owner of a package's loaded state.
//!
//! ```text
//! Uninitialized ──activate──▶ Active ──deactivate──▶ DeactivatePending ──delay──▶ Reclaimed
//!                               │
//!                               └──deactivate(shutdown)──▶ Terminated
//! ```
//!
//! Every activation gets a new generation. Contexts and the scheduled
//! reclaim task are tagged with it, so nothing left over from an earlier
//! activation can act on a later one.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::alias::{AliasRegistry, PLATFORM_DOMAIN, resource_root};
use crate::domain::derive_domain;
use crate::error::{BootstrapError, BootstrapResult};
use crate::manifest::{ManifestVariant, PackageManifest};
use crate::options::ResolvedOptions;
use crate::package_loader::{PackageLoader, loader_entry};
use crate::paths::{PathMapping, PathResolver};
use crate::prefs::{MemoryPreferences, PreferenceStore};
use crate::reason::LoadReason;
use crate::reclaim::{self, ReclaimReport};
use crate::sandbox::{ContextLoader, HostHandles, ModuleRecord, SandboxBackend};
use crate::version::PlatformVersion;

/// Grace period between deactivation and reclaim.
pub const DEFAULT_RECLAIM_DELAY: Duration = Duration::from_millis(1000);

/// Directory holding the resources of a legacy package.
const LEGACY_RESOURCES_DIR: &str = "resources/";

/// Source of controller ids used to claim package domains.
static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Host-side services a controller runs against.
#[derive(Clone)]
pub struct HostEnvironment {
    backend: Arc<dyn SandboxBackend>,
    platform_version: PlatformVersion,
    prefs: Arc<dyn PreferenceStore>,
    aliases: AliasRegistry,
    reclaim_delay: Duration,
}

impl fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("platform_version", &self.platform_version)
            .field("aliases", &self.aliases)
            .field("reclaim_delay", &self.reclaim_delay)
            .finish_non_exhaustive()
    }
}

impl HostEnvironment {
    /// Create an environment with empty preferences, a fresh alias
    /// registry and the default reclaim delay.
    #[must_use]
    pub fn new(backend: Arc<dyn SandboxBackend>, platform_version: PlatformVersion) -> Self {
        Self {
            backend,
            platform_version,
            prefs: Arc::new(MemoryPreferences::new()),
            aliases: AliasRegistry::new(),
            reclaim_delay: DEFAULT_RECLAIM_DELAY,
        }
    }

    /// Use `prefs` as the preference store.
    #[must_use]
    pub fn with_preferences(mut self, prefs: Arc<dyn PreferenceStore>) -> Self {
        self.prefs = prefs;
        self
    }

    /// Share an existing alias registry.
    #[must_use]
    pub fn with_aliases(mut self, aliases: AliasRegistry) -> Self {
        self.aliases = aliases;
        self
    }

    /// Set the grace period before reclaim.
    #[must_use]
    pub fn with_reclaim_delay(mut self, delay: Duration) -> Self {
        self.reclaim_delay = delay;
        self
    }

    /// Point `resource://platform/` at the directory containing the
    /// platform's `modules/` tree.
    #[must_use]
    pub fn with_platform_root(self, root: Url) -> Self {
        self.aliases.set_substitution(PLATFORM_DOMAIN, root);
        self
    }

    /// The sandbox backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Host platform version.
    #[must_use]
    pub fn platform_version(&self) -> &PlatformVersion {
        &self.platform_version
    }

    /// The preference store.
    #[must_use]
    pub fn preferences(&self) -> &dyn PreferenceStore {
        self.prefs.as_ref()
    }

    /// The alias registry.
    #[must_use]
    pub fn aliases(&self) -> &AliasRegistry {
        &self.aliases
    }

    /// Grace period before reclaim.
    #[must_use]
    pub fn reclaim_delay(&self) -> Duration {
        self.reclaim_delay
    }
}

/// What the host passes to [`LifecycleController::activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationData {
    /// Installed package root, a `file://` directory.
    pub root: Url,
    /// Why the package is being activated.
    pub reason: LoadReason,
}

impl ActivationData {
    /// Create activation data. A missing trailing `/` is added to `root`.
    #[must_use]
    pub fn new(mut root: Url, reason: LoadReason) -> Self {
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        Self { root, reason }
    }

    /// Create activation data from a numeric reason code.
    #[must_use]
    pub fn from_code(root: Url, code: u32) -> Self {
        Self::new(root, LoadReason::from_code(code))
    }
}

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Never activated.
    Uninitialized,
    /// Package loader running.
    Active,
    /// Unloaded; reclaim scheduled.
    DeactivatePending,
    /// Every context destroyed.
    Reclaimed,
    /// Deactivated for process shutdown; nothing was reclaimed.
    Terminated,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::DeactivatePending => "deactivate_pending",
            Self::Reclaimed => "reclaimed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Activation steps, reported when activation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ReadManifest,
    DeriveDomain,
    RegisterAlias,
    ResolvePaths,
    LocateLoader,
    BootLoader,
    BuildOptions,
    Startup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadManifest => "read_manifest",
            Self::DeriveDomain => "derive_domain",
            Self::RegisterAlias => "register_alias",
            Self::ResolvePaths => "resolve_paths",
            Self::LocateLoader => "locate_loader",
            Self::BootLoader => "boot_loader",
            Self::BuildOptions => "build_options",
            Self::Startup => "startup",
        };
        f.write_str(name)
    }
}

/// State of a running activation.
pub(crate) struct ActiveState {
    /// Controller holding the domain claim.
    pub(crate) owner: u64,
    pub(crate) domain: String,
    pub(crate) loader: ContextLoader,
    pub(crate) package_loader: PackageLoader,
    pub(crate) options: ResolvedOptions,
}

pub(crate) struct ControllerInner {
    pub(crate) state: ControllerState,
    pub(crate) generation: u64,
    pub(crate) active: Option<ActiveState>,
    pub(crate) reclaim_task: Option<JoinHandle<()>>,
}

/// Drives one package through activate → deactivate → reclaim.
#[derive(Clone)]
pub struct LifecycleController {
    id: u64,
    host: HostEnvironment,
    inner: Arc<Mutex<ControllerInner>>,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("LifecycleController")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Create an uninitialized controller.
    #[must_use]
    pub fn new(host: HostEnvironment) -> Self {
        Self {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
            host,
            inner: Arc::new(Mutex::new(ControllerInner {
                state: ControllerState::Uninitialized,
                generation: 0,
                active: None,
                reclaim_task: None,
            })),
        }
    }

    /// The environment this controller runs against.
    #[must_use]
    pub fn host(&self) -> &HostEnvironment {
        &self.host
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    /// Generation of the latest successful activation (0 before the first).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Options handed to the running package loader.
    #[must_use]
    pub fn options(&self) -> Option<ResolvedOptions> {
        self.lock().active.as_ref().map(|a| a.options.clone())
    }

    /// Alias domain of the running package.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        self.lock().active.as_ref().map(|a| a.domain.clone())
    }

    /// Number of contexts still alive.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.lock()
            .active
            .as_ref()
            .map_or(0, |a| a.loader.live_contexts())
    }

    /// Module records of the running package.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.lock()
            .active
            .as_ref()
            .map(|a| a.loader.modules())
            .unwrap_or_default()
    }

    /// Whether a reclaim task is scheduled.
    #[must_use]
    pub fn has_pending_reclaim(&self) -> bool {
        self.lock().reclaim_task.is_some()
    }

    /// Activate the package at `data.root`.
    ///
    /// A reclaim still pending from an earlier deactivation is performed
    /// first. If activation then fails, every context and alias it created
    /// is discarded and the controller keeps the state it had.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::AlreadyActive`] if a package is running on
    /// this controller, or if another controller sharing the alias registry
    /// runs the same package. Otherwise the error of the failing step (also
    /// logged with its error chain).
    pub fn activate(&self, data: &ActivationData) -> BootstrapResult<()> {
        let mut inner = self.lock();
        if inner.state == ControllerState::Active {
            let id = inner
                .active
                .as_ref()
                .map(|a| a.options.id.clone())
                .unwrap_or_default();
            return Err(BootstrapError::AlreadyActive(id));
        }
        reclaim::reclaim_pending(&mut inner, &self.host.aliases);

        let generation = inner.generation.saturating_add(1);
        match self.start(data, generation) {
            Ok(active) => {
                info!(
                    package = %active.options.id,
                    domain = %active.domain,
                    generation,
                    reason = %data.reason,
                    "Package activated"
                );
                inner.generation = generation;
                inner.active = Some(active);
                inner.state = ControllerState::Active;
                Ok(())
            },
            Err((step, e)) => {
                error!(
                    step = %step,
                    root = %data.root,
                    error = %e,
                    chain = %error_chain(&e),
                    "Package activation failed"
                );
                Err(e)
            },
        }
    }

    /// Deactivate the running package. Returns whether anything happened:
    /// outside [`ControllerState::Active`] this is a no-op.
    ///
    /// A failing `unload` is logged and does not stop the deactivation.
    ///
    /// The reclaim runs on the current Tokio runtime after the reclaim
    /// delay. Called outside a runtime, there is no grace period: the
    /// package is reclaimed before this returns.
    pub fn deactivate(&self, reason: LoadReason) -> bool {
        let mut inner = self.lock();
        if inner.state != ControllerState::Active {
            return false;
        }

        if let Some(active) = &inner.active {
            if let Err(e) = active.package_loader.unload(&active.loader, reason) {
                warn!(
                    package = %active.options.id,
                    reason = %reason,
                    error = %e,
                    "Package loader unload failed"
                );
            }
        }

        if reason.is_shutdown() {
            if let Some(active) = inner.active.take() {
                self.host.aliases.release_domain(&active.domain, active.owner);
            }
            inner.state = ControllerState::Terminated;
            info!(generation = inner.generation, "Package terminated for shutdown");
        } else {
            inner.state = ControllerState::DeactivatePending;
            info!(
                generation = inner.generation,
                reason = %reason,
                "Package deactivated, reclaim pending"
            );
            reclaim::schedule(
                &self.inner,
                &mut inner,
                &self.host.aliases,
                self.host.reclaim_delay,
            );
        }
        true
    }

    /// Run a pending reclaim now instead of waiting for its delay.
    pub fn reclaim_now(&self) -> Option<ReclaimReport> {
        reclaim::reclaim_pending(&mut self.lock(), &self.host.aliases)
    }

    fn start(
        &self,
        data: &ActivationData,
        generation: u64,
    ) -> Result<ActiveState, (Step, BootstrapError)> {
        let dir = package_dir(&data.root).map_err(|e| (Step::ReadManifest, e))?;
        let manifest = PackageManifest::probe(&dir).map_err(|e| (Step::ReadManifest, e))?;
        let id = manifest.id();
        let domain = derive_domain(&id).map_err(|e| (Step::DeriveDomain, e))?;

        let alias_target = match manifest.variant() {
            ManifestVariant::Native => data.root.clone(),
            ManifestVariant::Legacy => {
                join(&data.root, LEGACY_RESOURCES_DIR).map_err(|e| (Step::RegisterAlias, e))?
            },
        };
        let prefix_uri = resource_root(&domain).map_err(|e| (Step::RegisterAlias, e))?;
        if !self.host.aliases.claim_domain(&domain, self.id) {
            return Err((Step::RegisterAlias, BootstrapError::AlreadyActive(id)));
        }
        self.host.aliases.set_substitution(domain.clone(), alias_target);

        // From here on, a failure must undo the claim and aliases above.
        let result = self.boot(data, generation, &manifest, &id, &domain, prefix_uri);
        if result.is_err() {
            self.host.aliases.remove_domain(&domain);
            self.host.aliases.release_domain(&domain, self.id);
        }
        result
    }

    fn boot(
        &self,
        data: &ActivationData,
        generation: u64,
        manifest: &PackageManifest,
        id: &str,
        domain: &str,
        prefix_uri: Url,
    ) -> Result<ActiveState, (Step, BootstrapError)> {
        let resolver = PathResolver::new(
            self.host.prefs.as_ref(),
            &self.host.aliases,
            &self.host.platform_version,
        );
        let paths = resolver
            .resolve(manifest, domain)
            .map_err(|e| (Step::ResolvePaths, e))?;
        let entry = loader_entry(manifest, &paths).map_err(|e| (Step::LocateLoader, e))?;

        let loader = ContextLoader::new(
            Arc::clone(&self.host.backend),
            self.host.aliases.clone(),
            HostHandles::new(self.host.platform_version.as_str(), id, domain, generation),
        );

        // Contexts may exist as soon as the loader's top-level code runs.
        match Self::run_loader(&loader, entry, data, manifest, paths, prefix_uri) {
            Ok((package_loader, options)) => Ok(ActiveState {
                owner: self.id,
                domain: domain.to_owned(),
                loader,
                package_loader,
                options,
            }),
            Err(e) => {
                reclaim::teardown(&loader);
                Err(e)
            },
        }
    }

    fn run_loader(
        loader: &ContextLoader,
        entry: Url,
        data: &ActivationData,
        manifest: &PackageManifest,
        paths: PathMapping,
        prefix_uri: Url,
    ) -> Result<(PackageLoader, ResolvedOptions), (Step, BootstrapError)> {
        let package_loader =
            PackageLoader::boot(loader, entry).map_err(|e| (Step::BootLoader, e))?;

        let prefs_uri = manifest.prefs_path().and_then(|rel| {
            let base = if manifest.is_native() {
                &prefix_uri
            } else {
                &data.root
            };
            base.join(&rel).ok()
        });
        let options = ResolvedOptions::build(
            manifest,
            paths,
            data.reason,
            prefix_uri,
            &data.root,
            package_loader.context(),
        )
        .map_err(|e| (Step::BuildOptions, e))?;

        package_loader
            .start(
                loader,
                data.reason,
                &options,
                manifest.main().as_deref(),
                prefs_uri.as_ref(),
            )
            .map_err(|e| (Step::Startup, e))?;
        Ok((package_loader, options))
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn package_dir(root: &Url) -> BootstrapResult<PathBuf> {
    root.to_file_path()
        .map_err(|()| BootstrapError::InvalidLocation {
            location: root.to_string(),
            message: "package root must be a local file URL".to_owned(),
        })
}

fn join(base: &Url, rel: &str) -> BootstrapResult<Url> {
    base.join(rel).map_err(|e| BootstrapError::InvalidLocation {
        location: format!("{base}{rel}"),
        message: e.to_string(),
    })
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut chain = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ContextInstance, SandboxEnv, SandboxError, SandboxResult};

    struct RejectingBackend;

    impl SandboxBackend for RejectingBackend {
        fn instantiate(
            &self,
            location: &Url,
            _source: Vec<u8>,
            _env: SandboxEnv,
        ) -> SandboxResult<Box<dyn ContextInstance>> {
            Err(SandboxError::Load {
                location: location.to_string(),
                message: "rejected".to_owned(),
            })
        }
    }

    fn controller() -> LifecycleController {
        let host = HostEnvironment::new(Arc::new(RejectingBackend), "128.0".parse().unwrap());
        LifecycleController::new(host)
    }

    #[test]
    fn test_activation_data_normalizes_root() {
        let data = ActivationData::from_code(Url::parse("file:///opt/pkg").unwrap(), 3);
        assert_eq!(data.root.as_str(), "file:///opt/pkg/");
        assert_eq!(data.reason, LoadReason::Enable);
    }

    #[test]
    fn test_deactivate_before_activate_is_noop() {
        let controller = controller();
        assert!(!controller.deactivate(LoadReason::Disable));
        assert_eq!(controller.state(), ControllerState::Uninitialized);
    }

    #[test]
    fn test_failed_activation_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name": "demo"}"#).unwrap();
        let controller = controller();
        let root = Url::from_directory_path(dir.path()).unwrap();

        let err = controller
            .activate(&ActivationData::new(root, LoadReason::Startup))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Sandbox(_)));
        assert_eq!(controller.state(), ControllerState::Uninitialized);
        assert_eq!(controller.generation(), 0);
        assert!(!controller.host().aliases().contains("demo-at-skiff"));
    }

    #[test]
    fn test_missing_descriptor_fails_at_read() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller();
        let root = Url::from_directory_path(dir.path()).unwrap();

        let err = controller
            .activate(&ActivationData::new(root, LoadReason::Startup))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::ReadError { .. }));
        assert_eq!(controller.state(), ControllerState::Uninitialized);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = BootstrapError::ReadError {
            path: PathBuf::from("/x/package.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let chain = error_chain(&err);
        assert!(chain.starts_with("Failed to read /x/package.json"));
        assert!(chain.ends_with(": gone"));
    }
}
