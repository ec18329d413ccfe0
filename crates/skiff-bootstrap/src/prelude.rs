//! Prelude module - commonly used types for convenient import.
//!
//! Use `use skiff_bootstrap::prelude::*;` to import the types a host needs
//! to drive a package through its lifecycle.

// Errors
pub use crate::{BootstrapError, BootstrapResult};

// Lifecycle
pub use crate::{ActivationData, ControllerState, HostEnvironment, LifecycleController, LoadReason};

// Resolution inputs
pub use crate::{AliasRegistry, MemoryPreferences, PlatformVersion, PreferenceStore};

// Resolution outputs
pub use crate::{PackageManifest, PathMapping, ResolvedOptions};
