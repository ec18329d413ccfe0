//! Creates, calls and destroys the contexts of one activation.

use std::fs;
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};

use tracing::{debug, warn};
use url::Url;

use super::arena::{ContextArena, ContextRole, ContextSlot, ModuleRecord};
use super::{
    ContextId, Exports, HostHandles, SandboxBackend, SandboxEnv, SandboxError, SandboxResult,
};
use crate::alias::AliasRegistry;

/// A freshly loaded context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedContext {
    /// Id of the new context.
    pub id: ContextId,
    /// Its exports.
    pub exports: Exports,
}

struct Shared {
    backend: Arc<dyn SandboxBackend>,
    aliases: AliasRegistry,
    host: Arc<HostHandles>,
}

/// Owns the arena of one activation.
///
/// Dropping the loader drops every context it still holds, without calling
/// [`nuke`](super::ContextInstance::nuke); use [`destroy`](Self::destroy)
/// for an orderly teardown.
pub struct ContextLoader {
    shared: Arc<Shared>,
    arena: Arc<Mutex<ContextArena>>,
}

impl std::fmt::Debug for ContextLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLoader")
            .field("host", &self.shared.host)
            .finish_non_exhaustive()
    }
}

impl ContextLoader {
    /// Create a loader for the activation described by `host`.
    #[must_use]
    pub fn new(backend: Arc<dyn SandboxBackend>, aliases: AliasRegistry, host: HostHandles) -> Self {
        let generation = host.generation();
        Self {
            shared: Arc::new(Shared {
                backend,
                aliases,
                host: Arc::new(host),
            }),
            arena: Arc::new(Mutex::new(ContextArena::new(generation))),
        }
    }

    /// The host handles every context of this activation sees.
    #[must_use]
    pub fn host(&self) -> &HostHandles {
        &self.shared.host
    }

    /// Activation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.host.generation()
    }

    /// Create a bootstrap context from the source at `location` and run
    /// its top-level code.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Load`] if the location cannot be resolved or
    /// read, or if the backend rejects the source.
    pub fn load(&self, location: &Url) -> SandboxResult<LoadedContext> {
        let id = spawn(&self.shared, &self.arena, ContextRole::Bootstrap, None, location)?;
        Ok(LoadedContext {
            id,
            exports: Exports::new(id),
        })
    }

    /// Call an export through an exports handle.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Reclaimed`] if the context is gone,
    /// [`SandboxError::MissingExport`], [`SandboxError::Busy`] on re-entry,
    /// or the call's own error.
    pub fn invoke(&self, exports: &Exports, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>> {
        invoke(&self.arena, exports, name, input)
    }

    /// Destroy a context. Unknown or already destroyed ids are ignored.
    ///
    /// Returns whether a live context was destroyed. Teardown failures are
    /// logged and otherwise ignored.
    pub fn destroy(&self, id: ContextId) -> bool {
        let slot = {
            let mut arena = self.lock();
            if arena.has_live_exports(id) {
                let released = arena.release_exports_of(id);
                warn!(context = %id, released, "Destroying context with live module exports");
            }
            arena.remove(id)
        };
        let Some(slot) = slot else {
            debug!(context = %id, "Context already destroyed");
            return false;
        };

        match slot.instance.try_lock() {
            Ok(mut instance) => {
                if let Err(e) = instance.nuke() {
                    warn!(context = %id, error = %e, "Context teardown failed");
                }
            },
            Err(TryLockError::Poisoned(poisoned)) => {
                if let Err(e) = poisoned.into_inner().nuke() {
                    warn!(context = %id, error = %e, "Context teardown failed");
                }
            },
            Err(TryLockError::WouldBlock) => {
                warn!(context = %id, "Context destroyed while executing, dropping reference only");
            },
        }
        debug!(context = %id, location = %slot.location, "Destroyed context");
        true
    }

    /// Live contexts of `role`, in creation order.
    #[must_use]
    pub fn contexts(&self, role: ContextRole) -> Vec<ContextId> {
        self.lock().contexts(role)
    }

    /// Snapshot of the module records, in load order.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.lock().modules().to_vec()
    }

    /// Drop every exports handle held by a module record.
    pub fn release_module_exports(&self) -> usize {
        let mut arena = self.lock();
        let count = arena.modules().len();
        (0..count)
            .filter(|index| arena.release_exports(*index).is_some())
            .count()
    }

    /// Number of module records still holding exports.
    #[must_use]
    pub fn live_exports(&self) -> usize {
        self.lock().live_exports()
    }

    /// Number of live contexts.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.lock().len()
    }

    /// Whether a context is still alive.
    #[must_use]
    pub fn is_alive(&self, id: ContextId) -> bool {
        self.lock().contains(id)
    }

    /// Refuse any further context creation.
    pub fn seal(&self) {
        self.lock().seal();
    }

    /// Forget all module records.
    pub fn clear_modules(&self) {
        self.lock().clear_modules();
    }

    /// A handle contexts use to create more contexts. It stops working
    /// once the loader is sealed or dropped.
    #[must_use]
    pub fn downgrade(&self) -> NestedLoader {
        NestedLoader {
            shared: Arc::clone(&self.shared),
            arena: Arc::downgrade(&self.arena),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Weak counterpart of [`ContextLoader`] handed to each context.
#[derive(Clone)]
pub struct NestedLoader {
    shared: Arc<Shared>,
    arena: Weak<Mutex<ContextArena>>,
}

impl NestedLoader {
    fn arena(&self, owner: ContextId) -> SandboxResult<Arc<Mutex<ContextArena>>> {
        self.arena.upgrade().ok_or(SandboxError::Reclaimed(owner))
    }

    /// Create a loader-internal context on behalf of `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Reclaimed`] once the activation is gone, or
    /// the load error.
    pub fn load_nested(&self, owner: ContextId, location: &Url) -> SandboxResult<Exports> {
        let arena = self.arena(owner)?;
        let id = spawn(&self.shared, &arena, ContextRole::Nested, Some(owner), location)?;
        Ok(Exports::new(id))
    }

    /// Create a module context on behalf of `owner` and record it.
    ///
    /// # Errors
    ///
    /// Same as [`load_nested`](Self::load_nested).
    pub fn load_module(
        &self,
        owner: ContextId,
        module_id: &str,
        location: &Url,
    ) -> SandboxResult<Exports> {
        let arena = self.arena(owner)?;
        let id = spawn(&self.shared, &arena, ContextRole::Module, Some(owner), location)?;
        let exports = arena
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_module(module_id, id);
        debug!(module = module_id, context = %id, "Recorded module");
        Ok(exports)
    }

    /// Call an export of another context of the same activation.
    ///
    /// # Errors
    ///
    /// Same as [`ContextLoader::invoke`].
    pub fn invoke(&self, exports: &Exports, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>> {
        let arena = self.arena(exports.context())?;
        invoke(&arena, exports, name, input)
    }
}

fn spawn(
    shared: &Arc<Shared>,
    arena: &Arc<Mutex<ContextArena>>,
    role: ContextRole,
    owner: Option<ContextId>,
    location: &Url,
) -> SandboxResult<ContextId> {
    let load_error = |message: String| SandboxError::Load {
        location: location.to_string(),
        message,
    };

    let concrete = shared
        .aliases
        .resolve(location)
        .map_err(|e| load_error(e.to_string()))?;
    let path = concrete
        .to_file_path()
        .map_err(|()| load_error(format!("{concrete} is not a local file")))?;
    let source = fs::read(&path).map_err(|e| load_error(format!("{}: {e}", path.display())))?;

    // The arena is not locked while the backend runs top-level code, which
    // may itself create contexts.
    let id = arena.lock().unwrap_or_else(PoisonError::into_inner).reserve()?;
    let env = SandboxEnv::new(
        id,
        Arc::clone(&shared.host),
        NestedLoader {
            shared: Arc::clone(shared),
            arena: Arc::downgrade(arena),
        },
    );
    let instance = shared.backend.instantiate(location, source, env)?;

    let slot = ContextSlot {
        role,
        location: location.clone(),
        instance: Arc::new(Mutex::new(instance)),
    };
    if let Err(e) = arena
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, slot)
    {
        warn!(context = %id, "Activation torn down during load, discarding context");
        return Err(e);
    }

    debug!(
        context = %id,
        role = ?role,
        owner = ?owner,
        location = %location,
        "Created context"
    );
    Ok(id)
}

fn invoke(
    arena: &Mutex<ContextArena>,
    exports: &Exports,
    name: &str,
    input: &[u8],
) -> SandboxResult<Vec<u8>> {
    let id = exports.context();
    let instance = arena
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .instance(id)?;

    let mut guard = match instance.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return Err(SandboxError::Busy(id)),
    };
    if !guard.has_export(name) {
        return Err(SandboxError::MissingExport {
            context: id,
            export: name.to_owned(),
        });
    }
    guard.call(name, input)
}
