//! Activate → deactivate → reclaim against the scripted mock backend.
//!
//! Time is paused, so the reclaim delay elapses only when a test sleeps.

use std::time::Duration;

use serde_json::json;
use skiff_bootstrap::prelude::*;
use skiff_bootstrap::sandbox::ContextId;
use skiff_test::prelude::*;
use url::Url;

const NATIVE_DOMAIN: &str = "demo-at-skiff";

fn module_url(domain: &str, rel: &str) -> Url {
    Url::parse(&format!("resource://{domain}/{rel}")).unwrap()
}

/// A native package whose loader loads `lib/main.wasm` and `lib/util.wasm`
/// on startup, after creating one loader-internal context at init.
fn package_with_modules(platform: &PlatformFixture) -> PackageFixture {
    let loader = MockProgram::package_loader()
        .on_init(MockAction::LoadNested {
            location: Url::parse("resource://platform/modules/toolkit/cache.wasm").unwrap(),
        })
        .loading_module("startup", "./main", &module_url(NATIVE_DOMAIN, "lib/main.wasm"))
        .loading_module("startup", "./util", &module_url(NATIVE_DOMAIN, "lib/util.wasm"));
    platform.write_program("modules/toolkit/loader.wasm", &loader);
    platform.write_program("modules/toolkit/cache.wasm", &MockProgram::module());

    let package = PackageFixture::native("demo");
    package.write_program("lib/main.wasm", &MockProgram::module());
    package.write_program("lib/util.wasm", &MockProgram::module());
    package
}

#[tokio::test(start_paused = true)]
async fn test_disable_reaches_reclaimed_after_delay() {
    init_test_logging();
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(controller.generation(), 1);

    assert!(controller.deactivate(LoadReason::Disable));
    assert_eq!(controller.state(), ControllerState::DeactivatePending);
    assert!(controller.has_pending_reclaim());

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(controller.state(), ControllerState::DeactivatePending);
    assert!(backend.destroyed().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    tokio::task::yield_now().await;
    assert_eq!(controller.state(), ControllerState::Reclaimed);
    assert!(!controller.has_pending_reclaim());
    assert_eq!(backend.destroyed().len(), 1);
    assert!(!controller.host().aliases().contains(NATIVE_DOMAIN));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_without_reclaim() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert!(controller.deactivate(LoadReason::Shutdown));
    assert_eq!(controller.state(), ControllerState::Terminated);
    assert!(!controller.has_pending_reclaim());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(controller.state(), ControllerState::Terminated);
    assert!(backend.destroyed().is_empty());
    assert_eq!(backend.calls("unload"), vec![json!({ "reason": "shutdown" })]);
}

#[tokio::test(start_paused = true)]
async fn test_double_deactivate_unloads_once() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert!(controller.deactivate(LoadReason::Disable));
    assert!(!controller.deactivate(LoadReason::Disable));
    assert!(!controller.deactivate(LoadReason::Shutdown));

    assert_eq!(backend.calls("unload").len(), 1);
    assert_eq!(controller.state(), ControllerState::DeactivatePending);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    tokio::task::yield_now().await;
    assert_eq!(controller.state(), ControllerState::Reclaimed);
    assert!(!controller.deactivate(LoadReason::Disable));
    assert_eq!(backend.calls("unload").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reclaim_order_modules_then_nested_then_loader() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = package_with_modules(&platform);
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Install))
        .unwrap();
    let modules = controller.modules();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].module_id, "./main");
    assert_eq!(modules[1].module_id, "./util");
    assert_eq!(controller.live_contexts(), 4);

    let loader = backend
        .context_for("resource://platform/modules/toolkit/loader.wasm")
        .unwrap();
    let nested = backend
        .context_for("resource://platform/modules/toolkit/cache.wasm")
        .unwrap();
    let main = backend
        .context_for(module_url(NATIVE_DOMAIN, "lib/main.wasm").as_str())
        .unwrap();
    let util = backend
        .context_for(module_url(NATIVE_DOMAIN, "lib/util.wasm").as_str())
        .unwrap();

    controller.deactivate(LoadReason::Uninstall);
    let report = controller.reclaim_now().unwrap();
    assert_eq!(report.exports_released, 2);
    assert_eq!(report.modules, 2);
    assert_eq!(report.nested, 1);
    assert_eq!(report.bootstrap, 1);

    assert_eq!(backend.destroyed(), vec![main, util, nested, loader]);
    assert_eq!(controller.state(), ControllerState::Reclaimed);
    assert_eq!(controller.live_contexts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reactivation_flushes_pending_reclaim() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    controller.deactivate(LoadReason::Upgrade);
    let first: Vec<ContextId> = backend.instantiated().into_iter().map(|(id, _)| id).collect();

    controller
        .activate(&package.activation(LoadReason::Upgrade))
        .unwrap();
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(controller.generation(), 2);
    assert_eq!(backend.destroyed(), first);
    assert!(controller.host().aliases().contains(NATIVE_DOMAIN));

    // The first activation's task was cancelled; nothing fires later.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(backend.destroyed(), first);
    assert!(backend.destroyed().iter().all(|id| id.generation() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_activate_twice_is_rejected() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let err = controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap_err();
    assert!(matches!(err, BootstrapError::AlreadyActive(id) if id == "demo@skiff"));
    assert_eq!(controller.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_startup_failure_discards_everything() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let loader = MockProgram::package_loader()
        .loading_module("startup", "./main", &module_url(NATIVE_DOMAIN, "lib/main.wasm"))
        .failing("startup", "boom");
    platform.write_program("modules/toolkit/loader.wasm", &loader);
    let package = PackageFixture::native("demo");
    package.write_program("lib/main.wasm", &MockProgram::module());
    let controller = platform.controller(&backend);

    let err = controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(controller.state(), ControllerState::Uninitialized);
    assert_eq!(controller.generation(), 0);
    assert_eq!(controller.live_contexts(), 0);
    // The module the loader created before failing is torn down first.
    let main = backend
        .context_for(module_url(NATIVE_DOMAIN, "lib/main.wasm").as_str())
        .unwrap();
    let loader = backend
        .context_for("resource://platform/modules/toolkit/loader.wasm")
        .unwrap();
    assert_eq!(backend.destroyed(), vec![main, loader]);
    assert!(!controller.host().aliases().contains(NATIVE_DOMAIN));
}

#[tokio::test(start_paused = true)]
async fn test_boot_failure_destroys_nested_contexts() {
    let backend = MockBackend::new();
    let loader = MockProgram::package_loader()
        .on_init(MockAction::LoadNested {
            location: Url::parse("resource://platform/modules/toolkit/cache.wasm").unwrap(),
        })
        .on_init(MockAction::LoadNested {
            location: Url::parse("resource://platform/modules/toolkit/missing.wasm").unwrap(),
        });
    let platform = PlatformFixture::new(&loader);
    platform.write_program("modules/toolkit/cache.wasm", &MockProgram::module());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    let err = controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Sandbox(_)));

    let cache = backend
        .context_for("resource://platform/modules/toolkit/cache.wasm")
        .unwrap();
    assert_eq!(backend.instantiated().len(), 2);
    assert_eq!(backend.destroyed(), vec![cache]);
    assert_eq!(controller.state(), ControllerState::Uninitialized);
    assert!(!controller.host().aliases().contains(NATIVE_DOMAIN));
    assert_eq!(controller.host().aliases().domain_owner(NATIVE_DOMAIN), None);
}

#[tokio::test(start_paused = true)]
async fn test_one_controller_per_package() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let host = platform.host(&backend);
    let first = LifecycleController::new(host.clone());
    let second = LifecycleController::new(host);

    first
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let err = second
        .activate(&package.activation(LoadReason::Startup))
        .unwrap_err();
    assert!(matches!(err, BootstrapError::AlreadyActive(id) if id == "demo@skiff"));
    assert_eq!(second.state(), ControllerState::Uninitialized);
    assert_eq!(backend.instantiated().len(), 1);
    // The refused activation leaves the running package's alias alone.
    assert!(first.host().aliases().contains(NATIVE_DOMAIN));

    first.deactivate(LoadReason::Disable);
    first.reclaim_now();
    second
        .activate(&package.activation(LoadReason::Enable))
        .unwrap();
    assert_eq!(second.state(), ControllerState::Active);
    assert!(second.host().aliases().contains(NATIVE_DOMAIN));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_package_claim() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let host = platform.host(&backend);
    let first = LifecycleController::new(host.clone());
    let second = LifecycleController::new(host);

    first
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    first.deactivate(LoadReason::Shutdown);
    assert_eq!(first.state(), ControllerState::Terminated);

    second
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert_eq!(second.state(), ControllerState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_loader_init_failure_propagates() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader().failing_init("syntax"));
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    let err = controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Sandbox(_)));
    assert!(err.to_string().contains("syntax"));
    assert_eq!(controller.state(), ControllerState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_unload_failure_still_deactivates() {
    let backend = MockBackend::new();
    let platform =
        PlatformFixture::new(&MockProgram::package_loader().failing("unload", "cleanup failed"));
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert!(controller.deactivate(LoadReason::Disable));
    assert_eq!(controller.state(), ControllerState::DeactivatePending);
}

#[tokio::test(start_paused = true)]
async fn test_startup_request_payload() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native_with(&json!({
        "name": "demo",
        "version": "1.2.0",
        "main": "./lib/main",
        "prefs": "defaults/prefs.json",
    }))
    .with_config(&json!({ "staticArgs": { "flag": true }, "verbose": true }));
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Enable))
        .unwrap();

    let calls = backend.calls("startup");
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert_eq!(request["reason"], "enable");
    assert_eq!(request["main"], "./lib/main");
    assert_eq!(request["prefsURI"], "resource://demo-at-skiff/defaults/prefs.json");

    let options = &request["options"];
    assert_eq!(options["isNative"], true);
    assert_eq!(options["id"], "demo@skiff");
    assert_eq!(options["version"], "1.2.0");
    assert_eq!(options["loadReason"], "enable");
    assert_eq!(options["prefixURI"], "resource://demo-at-skiff/");
    assert_eq!(options["rootURI"], "resource://demo-at-skiff/");
    assert_eq!(options["staticArgs"], json!({ "flag": true }));
    assert_eq!(options["paths"]["./"], "resource://demo-at-skiff/");
    assert_eq!(options["modules"]["@test/options"]["verbose"], true);
    let (loader, _) = backend.instantiated().remove(0);
    assert_eq!(options["modules"]["toolkit/loader"]["context"], loader.to_string());
}

#[tokio::test(start_paused = true)]
async fn test_native_fallback_selects_native_loader() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    // A malformed primary descriptor only triggers the fallback.
    package.write("harness-options.json", b"{ not json");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let (_, location) = backend.instantiated().remove(0);
    assert_eq!(location.as_str(), "resource://platform/modules/toolkit/loader.wasm");
}

#[tokio::test(start_paused = true)]
async fn test_legacy_package_uses_bridge_loader() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::legacy("legacy@example.org", "legacy");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let (_, location) = backend.instantiated().remove(0);
    assert_eq!(
        location.as_str(),
        "resource://platform/modules/sdk/loader/bridge.wasm"
    );

    let domain = controller.domain().unwrap();
    assert_eq!(domain, "legacy-at-example-dot-org");
    let target = controller.host().aliases().get(&domain).unwrap();
    assert_eq!(target, package.root_url().join("resources/").unwrap());

    let options = controller.options().unwrap();
    assert!(!options.is_native);
    assert_eq!(options.root_uri, package.root_url());
    assert!(options.modules.loader.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_require_only_answers_host() {
    let backend = MockBackend::new();
    let loader = MockProgram::package_loader()
        .on_init(MockAction::Require {
            name: "host".to_owned(),
        })
        .on_init(MockAction::Require {
            name: "fs".to_owned(),
        });
    let platform = PlatformFixture::new(&loader);
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let granted: Vec<(String, bool)> = backend
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MockEvent::Required { name, granted, .. } => Some((name, granted)),
            _ => None,
        })
        .collect();
    assert_eq!(
        granted,
        vec![("host".to_owned(), true), ("fs".to_owned(), false)]
    );
}

#[test]
fn test_without_runtime_reclaims_immediately() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    let package = PackageFixture::native("demo");
    let controller = platform.controller(&backend);

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    assert!(controller.deactivate(LoadReason::Disable));
    assert_eq!(controller.state(), ControllerState::Reclaimed);
    assert_eq!(backend.destroyed().len(), 1);
}
