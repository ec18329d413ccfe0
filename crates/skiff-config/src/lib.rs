#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for the Skiff package runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use skiff_bootstrap::sandbox::WasmBackend;
//! use skiff_config::Config;
//!
//! let resolved = Config::load().unwrap();
//! let host = resolved
//!     .config
//!     .host_environment(Arc::new(WasmBackend::new()))
//!     .unwrap();
//! println!("Reclaim delay: {:?}", host.reclaim_delay());
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **User** (`~/.skiff/config.toml`)
//! 2. **System** (`/etc/skiff/config.toml`)
//! 3. **Environment variables** (`SKIFF_*`), for fields no file sets
//! 4. **Embedded defaults** (`defaults.toml` compiled into the binary)

/// Conversion into a bootstrap host environment.
mod bridge;
/// Environment variable fallback resolution.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::ResolvedConfig;
pub use merge::{ConfigLayer, FieldSources};
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load() -> ConfigResult<ResolvedConfig> {
        loader::load(None)
    }

    /// Load configuration reading the user layer from `skiff_home`
    /// instead of `~/.skiff`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load_with_home(skiff_home: &std::path::Path) -> ConfigResult<ResolvedConfig> {
        loader::load(Some(skiff_home))
    }

    /// Load configuration from a single file (no layering).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
