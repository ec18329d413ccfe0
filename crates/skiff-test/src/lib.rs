//! Skiff Test - Shared test utilities for the Skiff runtime.
//!
//! This crate provides a scripted sandbox backend and on-disk package
//! fixtures that can be used across Skiff crates as a dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skiff_test::{MockBackend, MockProgram, PackageFixture, PlatformFixture};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_disable_reclaims() {
//!     let backend = MockBackend::new();
//!     let platform = PlatformFixture::new(&MockProgram::package_loader());
//!     let package = PackageFixture::native("demo");
//!
//!     let controller = platform.controller(&backend);
//!     controller.activate(&package.activation(LoadReason::Startup)).unwrap();
//!     controller.deactivate(LoadReason::Disable);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; output goes through the test harness so it only
/// shows for failing tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
