//! Prelude module - commonly used test types.
//!
//! Use `use skiff_test::prelude::*;` in integration tests.

pub use crate::fixtures::{PackageFixture, PlatformFixture, TEST_PLATFORM_VERSION};
pub use crate::init_test_logging;
pub use crate::mocks::{MockAction, MockBackend, MockEvent, MockProgram};
