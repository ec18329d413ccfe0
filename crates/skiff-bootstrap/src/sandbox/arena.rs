//! Per-activation ownership of every context and module record.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use url::Url;

use super::{ContextId, ContextInstance, Exports, SandboxError, SandboxResult};

/// Who created a context and therefore when it is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// Created by the bootstrap to host the package loader.
    Bootstrap,
    /// Created by the loader for its own use.
    Nested,
    /// Created by the loader to host a package module.
    Module,
}

/// A module loaded by the package loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    /// Module id as the loader named it.
    pub module_id: String,
    /// Backing context.
    pub context: ContextId,
    /// Exports handle; `None` once released.
    pub exports: Option<Exports>,
}

pub(super) type SharedInstance = Arc<Mutex<Box<dyn ContextInstance>>>;

pub(super) struct ContextSlot {
    pub(super) role: ContextRole,
    pub(super) location: Url,
    pub(super) instance: SharedInstance,
}

/// Ordered collections of the contexts and module records of one
/// activation.
pub struct ContextArena {
    generation: u64,
    next_index: u64,
    slots: BTreeMap<u64, ContextSlot>,
    modules: Vec<ModuleRecord>,
    sealed: bool,
}

impl ContextArena {
    /// Create an empty arena for an activation generation.
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_index: 0,
            slots: BTreeMap::new(),
            modules: Vec::new(),
            sealed: false,
        }
    }

    /// Activation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand out the next context id.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Reclaimed`] once the arena is sealed.
    pub(super) fn reserve(&mut self) -> SandboxResult<ContextId> {
        let id = ContextId::new(self.generation, self.next_index);
        if self.sealed {
            return Err(SandboxError::Reclaimed(id));
        }
        self.next_index = self.next_index.wrapping_add(1);
        Ok(id)
    }

    pub(super) fn insert(&mut self, id: ContextId, slot: ContextSlot) -> SandboxResult<()> {
        if self.sealed || id.generation() != self.generation {
            return Err(SandboxError::Reclaimed(id));
        }
        self.slots.insert(id.index(), slot);
        Ok(())
    }

    pub(super) fn record_module(&mut self, module_id: &str, context: ContextId) -> Exports {
        let exports = Exports::new(context);
        self.modules.push(ModuleRecord {
            module_id: module_id.to_owned(),
            context,
            exports: Some(exports.clone()),
        });
        exports
    }

    pub(super) fn instance(&self, id: ContextId) -> SandboxResult<SharedInstance> {
        if id.generation() != self.generation {
            return Err(SandboxError::Reclaimed(id));
        }
        self.slots
            .get(&id.index())
            .map(|slot| Arc::clone(&slot.instance))
            .ok_or(SandboxError::Reclaimed(id))
    }

    pub(super) fn remove(&mut self, id: ContextId) -> Option<ContextSlot> {
        if id.generation() != self.generation {
            return None;
        }
        self.slots.remove(&id.index())
    }

    /// Stop accepting new contexts.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether the arena refuses new contexts.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether a context is still alive.
    #[must_use]
    pub fn contains(&self, id: ContextId) -> bool {
        id.generation() == self.generation && self.slots.contains_key(&id.index())
    }

    /// Live contexts with `role`, in creation order.
    #[must_use]
    pub fn contexts(&self, role: ContextRole) -> Vec<ContextId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.role == role)
            .map(|(index, _)| ContextId::new(self.generation, *index))
            .collect()
    }

    /// Location a live context was loaded from.
    #[must_use]
    pub fn location(&self, id: ContextId) -> Option<&Url> {
        if id.generation() != self.generation {
            return None;
        }
        self.slots.get(&id.index()).map(|slot| &slot.location)
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no context is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Module records, in load order.
    #[must_use]
    pub fn modules(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Number of module records still holding exports.
    #[must_use]
    pub fn live_exports(&self) -> usize {
        self.modules.iter().filter(|m| m.exports.is_some()).count()
    }

    /// Whether any module record still holds exports of `context`.
    #[must_use]
    pub fn has_live_exports(&self, context: ContextId) -> bool {
        self.modules
            .iter()
            .any(|m| m.context == context && m.exports.is_some())
    }

    /// Release the exports handle of one module record.
    pub fn release_exports(&mut self, module_index: usize) -> Option<Exports> {
        self.modules.get_mut(module_index).and_then(|m| m.exports.take())
    }

    /// Release every exports handle held for `context`.
    pub fn release_exports_of(&mut self, context: ContextId) -> usize {
        self.modules
            .iter_mut()
            .filter(|m| m.context == context)
            .filter_map(|m| m.exports.take())
            .count()
    }

    /// Forget all module records.
    pub fn clear_modules(&mut self) {
        self.modules.clear();
    }
}
