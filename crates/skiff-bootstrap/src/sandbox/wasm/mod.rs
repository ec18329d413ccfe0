//! Extism-backed contexts.
//!
//! Every context is its own Extism plugin: separate linear memory, no WASI,
//! and only the `skiff_*` host functions registered by [`host`]. If the
//! module exports `init`, it is called once as the module's top-level code.

mod host;

use std::time::Duration;

use extism::{Manifest, Plugin, PluginBuilder, UserData, Wasm};
use tracing::debug;
use url::Url;

use super::{ContextId, ContextInstance, SandboxBackend, SandboxEnv, SandboxError, SandboxResult};

/// Export called once after instantiation.
pub const INIT_EXPORT: &str = "init";

/// Default wall-clock limit for one call into a context.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default linear memory limit per context.
pub const DEFAULT_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// [`SandboxBackend`] running WebAssembly modules through Extism.
#[derive(Debug, Clone)]
pub struct WasmBackend {
    timeout: Duration,
    memory_limit: u64,
}

impl Default for WasmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmBackend {
    /// Create a backend with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-context memory limit in bytes.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-context memory limit in bytes.
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}

impl SandboxBackend for WasmBackend {
    fn instantiate(
        &self,
        location: &Url,
        source: Vec<u8>,
        env: SandboxEnv,
    ) -> SandboxResult<Box<dyn ContextInstance>> {
        let context = env.context();
        let load_error = |message: String| SandboxError::Load {
            location: location.to_string(),
            message,
        };

        let pages = u32::try_from(self.memory_limit / WASM_PAGE_SIZE).unwrap_or(u32::MAX);
        let manifest = Manifest::new([Wasm::data(source)])
            .with_timeout(self.timeout)
            .with_memory_max(pages);

        let builder = PluginBuilder::new(manifest).with_wasi(false);
        let builder = host::register_host_functions(builder, UserData::new(host::HostState { env }));
        let mut plugin = builder
            .build()
            .map_err(|e| load_error(format!("failed to build plugin: {e}")))?;

        if plugin.function_exists(INIT_EXPORT) {
            plugin
                .call::<&[u8], Vec<u8>>(INIT_EXPORT, &[])
                .map_err(|e| load_error(format!("`{INIT_EXPORT}` failed: {e}")))?;
        }

        debug!(context = %context, location = %location, "Instantiated wasm context");
        Ok(Box::new(WasmInstance {
            context,
            plugin: Some(plugin),
        }))
    }
}

/// A context backed by one Extism plugin.
pub struct WasmInstance {
    context: ContextId,
    plugin: Option<Plugin>,
}

impl std::fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmInstance")
            .field("context", &self.context)
            .field("alive", &self.plugin.is_some())
            .finish()
    }
}

impl ContextInstance for WasmInstance {
    fn has_export(&self, name: &str) -> bool {
        self.plugin
            .as_ref()
            .is_some_and(|plugin| plugin.function_exists(name))
    }

    fn call(&mut self, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>> {
        let plugin = self
            .plugin
            .as_mut()
            .ok_or(SandboxError::Reclaimed(self.context))?;
        plugin
            .call::<&[u8], Vec<u8>>(name, input)
            .map_err(|e| SandboxError::Execution {
                context: self.context,
                export: name.to_owned(),
                message: e.to_string(),
            })
    }

    fn nuke(&mut self) -> SandboxResult<()> {
        // Dropping the plugin frees its store, memory and host state.
        self.plugin = None;
        Ok(())
    }
}
