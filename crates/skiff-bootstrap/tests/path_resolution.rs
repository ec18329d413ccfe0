//! Path mapping layers and their precedence.

use serde_json::json;
use skiff_bootstrap::prelude::*;
use skiff_bootstrap::{PathResolver, PrefValue, paths::USE_BUNDLED_RUNTIME_PREF};
use skiff_test::prelude::*;

fn resolve(
    package: &PackageFixture,
    prefs: &MemoryPreferences,
    version: &str,
) -> (PathMapping, AliasRegistry) {
    let manifest = PackageManifest::probe(package.path()).unwrap();
    let domain = skiff_bootstrap::derive_domain(&manifest.id()).unwrap();
    let aliases = AliasRegistry::new();
    let version: PlatformVersion = version.parse().unwrap();
    let paths = PathResolver::new(prefs, &aliases, &version)
        .resolve(&manifest, &domain)
        .unwrap();
    (paths, aliases)
}

fn entry<'a>(paths: &'a PathMapping, prefix: &str) -> &'a str {
    paths.get(prefix).map_or("<unmapped>", url::Url::as_str)
}

fn string(value: &str) -> PrefValue {
    PrefValue::String(value.to_owned())
}

#[test]
fn test_native_defaults() {
    let package = PackageFixture::native("demo");
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "128.0");

    let entries: Vec<(&str, &str)> = paths.iter().map(|(p, l)| (p, l.as_str())).collect();
    assert_eq!(
        entries,
        vec![
            ("./", "resource://demo-at-skiff/"),
            ("./tests/", "resource://demo-at-skiff/"),
            ("", "resource://platform/modules/"),
        ]
    );
}

#[test]
fn test_legacy_sub_packages() {
    let package = PackageFixture::legacy_with(&json!({
        "packageId": "addon@example.org",
        "name": "addon",
        "metadata": {
            "addon": { "permissions": { "private-browsing": true } },
            "addon-kit": {},
        },
    }));
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "128.0");

    let base = "resource://addon-at-example-dot-org/";
    assert_eq!(entry(&paths, "./"), format!("{base}addon/lib/"));
    assert_eq!(entry(&paths, "./tests/"), format!("{base}addon/tests/"));
    assert_eq!(entry(&paths, "addon/"), format!("{base}addon/lib/"));
    assert_eq!(entry(&paths, "addon-kit/"), format!("{base}addon-kit/lib/"));
    assert_eq!(
        entry(&paths, "addon-kit/tests/"),
        format!("{base}addon-kit/tests/")
    );
    assert_eq!(entry(&paths, ""), "resource://platform/modules/");
    assert!(!paths.contains("runtime"));
}

#[test]
fn test_old_platform_uses_bundled_runtime() {
    let package = PackageFixture::native("demo");
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "20.0");

    assert_eq!(entry(&paths, ""), "resource://demo-at-skiff/skiff-runtime/lib/");
    assert_eq!(
        entry(&paths, "runtime"),
        "resource://demo-at-skiff/skiff-runtime/lib/sdk/runtime.wasm"
    );
}

#[test]
fn test_cutoff_prerelease_does_not_bundle() {
    let package = PackageFixture::native("demo");
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "21.0a1");
    assert_eq!(entry(&paths, ""), "resource://platform/modules/");
}

#[test]
fn test_bundled_runtime_forced_by_preference_or_option() {
    let package = PackageFixture::native("demo");
    let prefs = MemoryPreferences::new().with(USE_BUNDLED_RUNTIME_PREF, PrefValue::Bool(true));
    let (paths, _) = resolve(&package, &prefs, "128.0");
    assert!(paths.contains("runtime"));

    let package = PackageFixture::native("demo")
        .with_config(&json!({ "force-use-bundled-runtime": true, "is-runtime-bundled": true }));
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "128.0");
    assert_eq!(entry(&paths, ""), "resource://demo-at-skiff/skiff-runtime/lib/");
}

#[test]
fn test_runtime_package_tests_shortcut() {
    let package = PackageFixture::legacy("skiff-runtime@skiff", "skiff-runtime");
    let (paths, _) = resolve(&package, &MemoryPreferences::new(), "128.0");
    assert_eq!(
        entry(&paths, "tests/"),
        "resource://skiff-runtime-at-skiff/skiff-runtime/tests/"
    );
}

#[test]
fn test_preference_overrides_register_aliases() {
    let package = PackageFixture::native("demo");
    let prefs = MemoryPreferences::new()
        .with("extensions.modules.demo@skiff.path", string("file:///dev/root"))
        .with("extensions.modules.demo@skiff.path.sdk.io", string("file:///dev/io/"));
    let (paths, aliases) = resolve(&package, &prefs, "128.0");

    let root_alias = "extensions.modules.demo-at-skiff.commonjs.path";
    assert_eq!(entry(&paths, ""), format!("resource://{root_alias}/"));
    assert_eq!(
        aliases.get(root_alias).unwrap().as_str(),
        "file:///dev/root/"
    );

    let io_alias = "extensions.modules.demo-at-skiff.commonjs.path.sdk.io";
    assert_eq!(entry(&paths, "sdk/io/"), format!("resource://{io_alias}/"));
    assert_eq!(aliases.get(io_alias).unwrap().as_str(), "file:///dev/io/");
}

#[test]
fn test_override_beats_bundled_runtime() {
    let package = PackageFixture::native("demo");
    let prefs = MemoryPreferences::new()
        .with("extensions.modules.demo@skiff.path", string("file:///dev/root/"));
    let (paths, _) = resolve(&package, &prefs, "20.0");

    assert_eq!(
        entry(&paths, ""),
        "resource://extensions.modules.demo-at-skiff.commonjs.path/"
    );
    // The runtime entry itself is not overridden.
    assert!(paths.contains("runtime"));
}

#[test]
fn test_invalid_overrides_are_skipped() {
    let package = PackageFixture::native("demo");
    let prefs = MemoryPreferences::new()
        .with("extensions.modules.demo@skiff.path.empty", string("  "))
        .with("extensions.modules.demo@skiff.path.flag", PrefValue::Bool(true))
        .with("extensions.modules.demo@skiff.path..double", string("file:///x/"))
        .with("extensions.modules.demo@skiff.pathology", string("file:///x/"));
    let (paths, aliases) = resolve(&package, &prefs, "128.0");

    assert_eq!(paths.len(), 3);
    assert_eq!(entry(&paths, ""), "resource://platform/modules/");
    assert!(!aliases.contains("extensions.modules.demo-at-skiff.commonjs.path.empty"));
}

#[test]
fn test_resolution_is_deterministic() {
    let package = PackageFixture::native("demo");
    let prefs = MemoryPreferences::new()
        .with("extensions.modules.demo@skiff.path.b", string("file:///b/"))
        .with("extensions.modules.demo@skiff.path.a", string("file:///a/"));
    let (first, _) = resolve(&package, &prefs, "128.0");
    let (second, _) = resolve(&package, &prefs, "128.0");
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_sdk_override_relocates_loader_entry() {
    let backend = MockBackend::new();
    let platform = PlatformFixture::new(&MockProgram::package_loader());
    platform.write_program("dev-sdk/loader/bridge.wasm", &MockProgram::package_loader());
    let package = PackageFixture::legacy("legacy@skiff", "legacy");

    let prefs = MemoryPreferences::new().with(
        "extensions.modules.legacy@skiff.path.sdk",
        PrefValue::String(platform.file_url("dev-sdk").to_string()),
    );
    let controller = LifecycleController::new(platform.host_with(
        &backend,
        prefs,
        TEST_PLATFORM_VERSION,
    ));

    controller
        .activate(&package.activation(LoadReason::Startup))
        .unwrap();
    let (_, location) = backend.instantiated().remove(0);
    assert_eq!(
        location.as_str(),
        "resource://extensions.modules.legacy-at-skiff.commonjs.path.sdk/loader/bridge.wasm"
    );

    controller.deactivate(LoadReason::Disable);
    controller.reclaim_now();
    assert!(
        !controller
            .host()
            .aliases()
            .contains("extensions.modules.legacy-at-skiff.commonjs.path.sdk")
    );
}
