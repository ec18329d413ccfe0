//! Conversion from configuration to the bootstrap's host environment.

use std::sync::Arc;

use skiff_bootstrap::sandbox::SandboxBackend;
use skiff_bootstrap::{HostEnvironment, PlatformVersion};
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

impl Config {
    /// Build a host environment running `backend` with these settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform version does not parse, the
    /// platform root is not an absolute directory path, or a preference
    /// value is unsupported.
    pub fn host_environment(&self, backend: Arc<dyn SandboxBackend>) -> ConfigResult<HostEnvironment> {
        let b = &self.bootstrap;
        let version: PlatformVersion = b
            .platform_version
            .parse()
            .map_err(skiff_bootstrap::BootstrapError::from)?;

        let mut host = HostEnvironment::new(backend, version)
            .with_preferences(Arc::new(self.preference_store()?))
            .with_reclaim_delay(b.reclaim_delay());

        if let Some(root) = &b.platform_root {
            let url = Url::from_directory_path(root).map_err(|()| ConfigError::ValidationError {
                field: "bootstrap.platform_root".to_owned(),
                message: format!("'{}' is not an absolute directory path", root.display()),
            })?;
            host = host.with_platform_root(url);
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use skiff_bootstrap::PreferenceStore;
    use skiff_bootstrap::sandbox::WasmBackend;

    #[test]
    fn test_host_environment_carries_settings() {
        let config: Config = toml::from_str(
            r#"
            [bootstrap]
            reclaim_delay_ms = 5
            platform_version = "20.0"
            platform_root = "/usr/lib/skiff"

            [preferences]
            "extensions.skiff-runtime.useBundledRuntime" = true
            "#,
        )
        .unwrap();

        let host = config.host_environment(Arc::new(WasmBackend::new())).unwrap();
        assert_eq!(host.reclaim_delay(), Duration::from_millis(5));
        assert!(host.platform_version().needs_bundled_runtime());
        assert_eq!(
            host.preferences().get_bool("extensions.skiff-runtime.useBundledRuntime"),
            Some(true)
        );
        assert_eq!(
            host.aliases().get("platform").unwrap().as_str(),
            "file:///usr/lib/skiff/"
        );
    }

    #[test]
    fn test_without_platform_root_no_alias_registered() {
        let host = Config::default()
            .host_environment(Arc::new(WasmBackend::new()))
            .unwrap();
        assert!(!host.aliases().contains("platform"));
    }

    #[test]
    fn test_bad_version_is_host_error() {
        let mut config = Config::default();
        config.bootstrap.platform_version = " ".to_owned();
        let err = config
            .host_environment(Arc::new(WasmBackend::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Host(_)));

        let mut config = Config::default();
        config.bootstrap.platform_root = Some(PathBuf::from("relative"));
        let err = config
            .host_environment(Arc::new(WasmBackend::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }
}
