//! Isolated execution contexts.
//!
//! A context is created by a [`SandboxBackend`] from the bytes at a
//! location and runs with exactly two capabilities, both reached through
//! its [`SandboxEnv`]:
//!
//! - `require("host")`, answering a frozen [`HostHandles`] bundle (any other
//!   name is refused),
//! - `loadNested`, creating further contexts. The package loader uses it to
//!   host each of its modules.
//!
//! Every context lives in the [`ContextArena`] of the activation that
//! created it. Nothing outside the arena holds a context directly; callers
//! hold [`Exports`] handles and go through the [`ContextLoader`], which
//! refuses to touch a context once it has been destroyed.

mod arena;
mod loader;
pub mod wasm;

pub use arena::{ContextArena, ContextRole, ModuleRecord};
pub use loader::{ContextLoader, LoadedContext, NestedLoader};
pub use wasm::WasmBackend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use url::Url;

/// The only module name `require` answers.
pub const HOST_MODULE: &str = "host";

/// Errors raised by isolated contexts.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The source could not be read or failed to execute.
    #[error("Failed to load {location}: {message}")]
    Load {
        /// Location being loaded.
        location: String,
        /// What went wrong.
        message: String,
    },

    /// A call into a context failed.
    #[error("Call to `{export}` in {context} failed: {message}")]
    Execution {
        /// Context that was called.
        context: ContextId,
        /// Export that was called.
        export: String,
        /// What went wrong.
        message: String,
    },

    /// The context has been destroyed, or belongs to an activation that
    /// has been reclaimed.
    #[error("Context {0} has been reclaimed")]
    Reclaimed(ContextId),

    /// The context does not export the requested entry point.
    #[error("Context {context} does not export `{export}`")]
    MissingExport {
        /// Context that was called.
        context: ContextId,
        /// Missing export.
        export: String,
    },

    /// The context is already executing a call.
    #[error("Context {0} is busy")]
    Busy(ContextId),

    /// `require` was asked for something other than [`HOST_MODULE`].
    #[error("Sandbox `require` only provides `{HOST_MODULE}`, not `{0}`")]
    UnknownModule(String),
}

/// A specialized Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Generation-tagged context identifier.
///
/// The generation is the activation that created the context, so a handle
/// left over from a reclaimed activation never aliases a fresh context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId {
    generation: u64,
    index: u64,
}

impl ContextId {
    pub(crate) fn new(generation: u64, index: u64) -> Self {
        Self { generation, index }
    }

    /// Activation generation that created this context.
    #[must_use]
    pub fn generation(self) -> u64 {
        self.generation
    }

    /// Creation order within the generation.
    #[must_use]
    pub fn index(self) -> u64 {
        self.index
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}.{}", self.generation, self.index)
    }
}

impl FromStr for ContextId {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SandboxError::Load {
            location: s.to_owned(),
            message: "malformed context id".to_owned(),
        };
        let (generation, index) = s
            .strip_prefix("ctx-")
            .and_then(|rest| rest.split_once('.'))
            .ok_or_else(bad)?;
        Ok(Self {
            generation: generation.parse().map_err(|_| bad())?,
            index: index.parse().map_err(|_| bad())?,
        })
    }
}

/// Handle to the exports of a context.
///
/// Holding a handle does not keep the context alive; reads through a
/// handle whose context was destroyed fail with
/// [`SandboxError::Reclaimed`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exports {
    context: ContextId,
}

impl Exports {
    pub(crate) fn new(context: ContextId) -> Self {
        Self { context }
    }

    /// The context these exports belong to.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }
}

/// Low-level host information exposed through `require("host")`.
///
/// Fields are private and there are no setters; contexts share one
/// immutable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostHandles {
    platform_version: String,
    package_id: String,
    domain: String,
    generation: u64,
}

impl HostHandles {
    /// Create the handle bundle for one activation.
    #[must_use]
    pub fn new(
        platform_version: impl Into<String>,
        package_id: impl Into<String>,
        domain: impl Into<String>,
        generation: u64,
    ) -> Self {
        Self {
            platform_version: platform_version.into(),
            package_id: package_id.into(),
            domain: domain.into(),
            generation,
        }
    }

    /// Host platform version.
    #[must_use]
    pub fn platform_version(&self) -> &str {
        &self.platform_version
    }

    /// Identifier of the package being hosted.
    #[must_use]
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    /// The package's alias domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Activation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A running isolated context.
pub trait ContextInstance: Send {
    /// Whether the context exports `name`.
    fn has_export(&self, name: &str) -> bool;

    /// Call an exported entry point with a serialized payload.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Execution`] if the call traps or fails.
    fn call(&mut self, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>>;

    /// Forcefully tear down the context's internals. Called exactly once,
    /// right before the instance is dropped.
    ///
    /// # Errors
    ///
    /// Failures are logged by the caller and otherwise ignored.
    fn nuke(&mut self) -> SandboxResult<()> {
        Ok(())
    }
}

/// Creates isolated contexts.
pub trait SandboxBackend: Send + Sync {
    /// Create a context from `source` and run its top-level code.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Load`] if the source is invalid or its
    /// top-level code fails.
    fn instantiate(
        &self,
        location: &Url,
        source: Vec<u8>,
        env: SandboxEnv,
    ) -> SandboxResult<Box<dyn ContextInstance>>;
}

/// The capability surface of one context.
#[derive(Clone)]
pub struct SandboxEnv {
    context: ContextId,
    host: Arc<HostHandles>,
    loader: NestedLoader,
}

impl fmt::Debug for SandboxEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxEnv")
            .field("context", &self.context)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SandboxEnv {
    pub(crate) fn new(context: ContextId, host: Arc<HostHandles>, loader: NestedLoader) -> Self {
        Self {
            context,
            host,
            loader,
        }
    }

    /// The context this environment belongs to.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The sandbox `require`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::UnknownModule`] for anything but
    /// [`HOST_MODULE`].
    pub fn require(&self, name: &str) -> SandboxResult<Arc<HostHandles>> {
        if name == HOST_MODULE {
            Ok(Arc::clone(&self.host))
        } else {
            Err(SandboxError::UnknownModule(name.to_owned()))
        }
    }

    /// Create a nested context owned by the caller (not a module).
    ///
    /// # Errors
    ///
    /// Returns the load error, or [`SandboxError::Reclaimed`] once the
    /// activation has been torn down.
    pub fn load_nested(&self, location: &Url) -> SandboxResult<Exports> {
        self.loader.load_nested(self.context, location)
    }

    /// Create a module context and record it as a [`ModuleRecord`].
    ///
    /// # Errors
    ///
    /// Same as [`load_nested`](Self::load_nested).
    pub fn load_module(&self, module_id: &str, location: &Url) -> SandboxResult<Exports> {
        self.loader.load_module(self.context, module_id, location)
    }

    /// Call an export of another context.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Reclaimed`] if the target is gone, or the
    /// call's own error.
    pub fn invoke(&self, exports: &Exports, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>> {
        self.loader.invoke(exports, name, input)
    }
}
