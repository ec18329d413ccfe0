#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Package bootstrap and lifecycle management for the Skiff runtime.
//!
//! Given an installed package's root location, this crate:
//!
//! - probes the package descriptor (legacy `harness-options.json` or native
//!   `package.json` + `config.json`) and resolves it into one
//!   [`PackageManifest`],
//! - builds the prefix → location [`PathMapping`] the package loader uses,
//!   layering defaults, sub-package declarations, the bundled runtime and
//!   preference overrides,
//! - boots the package loader inside an isolated context
//!   ([`sandbox::ContextLoader`]) and starts it with [`ResolvedOptions`],
//! - tears everything down on deactivation, force-destroying every context
//!   in a fixed order after a grace delay ([`reclaim`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use skiff_bootstrap::prelude::*;
//! use skiff_bootstrap::sandbox::WasmBackend;
//!
//! # async fn run() -> BootstrapResult<()> {
//! let host = HostEnvironment::new(Arc::new(WasmBackend::new()), "128.0".parse()?);
//! let controller = LifecycleController::new(host);
//!
//! let root = url::Url::parse("file:///opt/packages/hello/").unwrap();
//! controller.activate(&ActivationData::new(root, LoadReason::Startup))?;
//! controller.deactivate(LoadReason::Disable);
//! # Ok(())
//! # }
//! ```

pub mod alias;
pub mod controller;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod options;
pub mod package_loader;
pub mod paths;
pub mod prefs;
pub mod prelude;
pub mod reason;
pub mod reclaim;
pub mod sandbox;
pub mod version;

pub use alias::{AliasRegistry, RESOURCE_SCHEME};
pub use controller::{ActivationData, ControllerState, HostEnvironment, LifecycleController};
pub use domain::derive_domain;
pub use error::{BootstrapError, BootstrapResult};
pub use manifest::{LegacyManifest, ManifestVariant, NativeManifest, PackageManifest};
pub use options::{ExportsRef, ResolvedOptions, TestOptions};
pub use paths::{PathMapping, PathResolver};
pub use prefs::{MemoryPreferences, PrefValue, PreferenceStore};
pub use reason::LoadReason;
pub use version::PlatformVersion;
