//! Deferred reclamation of a deactivated package.
//!
//! After a non-shutdown deactivation the package gets a grace delay to
//! finish asynchronous cleanup. Then every context it created is
//! force-destroyed in a fixed order:
//!
//! 1. module exports handles are dropped,
//! 2. module contexts are destroyed,
//! 3. loader-internal nested contexts are destroyed, then the loader's
//!    bootstrap context,
//! 4. the package's aliases and domain claim are removed and the
//!    controller moves to [`ControllerState::Reclaimed`].
//!
//! The scheduled task carries the generation it was scheduled for and
//! no-ops unless the controller is still deactivating that generation.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::alias::AliasRegistry;
use crate::controller::{ControllerInner, ControllerState};
use crate::sandbox::{ContextLoader, ContextRole};

/// Counts of what one reclaim destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Module exports handles released.
    pub exports_released: usize,
    /// Module contexts destroyed.
    pub modules: usize,
    /// Loader-internal contexts destroyed.
    pub nested: usize,
    /// Bootstrap contexts destroyed.
    pub bootstrap: usize,
    /// Aliases removed.
    pub aliases: usize,
}

/// Schedule the reclaim of `generation` after `delay`.
///
/// Must be called with the controller locked and already in
/// [`ControllerState::DeactivatePending`]. Without a Tokio runtime there is
/// nothing to schedule on, so the reclaim runs right away.
pub(crate) fn schedule(
    shared: &Arc<Mutex<ControllerInner>>,
    inner: &mut ControllerInner,
    aliases: &AliasRegistry,
    delay: Duration,
) {
    let generation = inner.generation;
    match Handle::try_current() {
        Ok(handle) => {
            let shared = Arc::clone(shared);
            let aliases = aliases.clone();
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            debug!(generation, delay_ms, "Scheduled reclaim");
            inner.reclaim_task = Some(handle.spawn(async move {
                tokio::time::sleep(delay).await;
                reclaim_if_current(&shared, &aliases, generation);
            }));
        },
        Err(_) => {
            debug!(generation, "No async runtime, reclaiming immediately");
            reclaim_locked(inner, aliases);
        },
    }
}

/// Body of the scheduled task.
pub(crate) fn reclaim_if_current(
    shared: &Mutex<ControllerInner>,
    aliases: &AliasRegistry,
    generation: u64,
) -> Option<ReclaimReport> {
    let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
    if inner.state != ControllerState::DeactivatePending || inner.generation != generation {
        debug!(
            generation,
            current = inner.generation,
            state = %inner.state,
            "Skipping stale reclaim"
        );
        return None;
    }
    Some(reclaim_locked(&mut inner, aliases))
}

/// Flush a pending reclaim synchronously, cancelling its task.
pub(crate) fn reclaim_pending(
    inner: &mut ControllerInner,
    aliases: &AliasRegistry,
) -> Option<ReclaimReport> {
    if inner.state != ControllerState::DeactivatePending {
        return None;
    }
    if let Some(task) = inner.reclaim_task.take() {
        task.abort();
    }
    Some(reclaim_locked(inner, aliases))
}

fn reclaim_locked(inner: &mut ControllerInner, aliases: &AliasRegistry) -> ReclaimReport {
    let mut report = ReclaimReport::default();

    if let Some(active) = inner.active.take() {
        report = teardown(&active.loader);
        report.aliases = aliases.remove_domain(&active.domain);
        aliases.release_domain(&active.domain, active.owner);
        info!(
            package = %active.options.id,
            generation = inner.generation,
            exports = report.exports_released,
            modules = report.modules,
            nested = report.nested,
            bootstrap = report.bootstrap,
            aliases = report.aliases,
            "Reclaimed package"
        );
    }

    inner.state = ControllerState::Reclaimed;
    // Dropped, not aborted: this may be the task currently running.
    inner.reclaim_task = None;
    report
}

/// Destroy every context of an activation in reclaim order. Aliases are
/// left alone.
pub(crate) fn teardown(loader: &ContextLoader) -> ReclaimReport {
    loader.seal();
    let report = ReclaimReport {
        exports_released: loader.release_module_exports(),
        modules: destroy_all(loader, ContextRole::Module),
        nested: destroy_all(loader, ContextRole::Nested),
        bootstrap: destroy_all(loader, ContextRole::Bootstrap),
        aliases: 0,
    };
    loader.clear_modules();
    report
}

fn destroy_all(loader: &ContextLoader, role: ContextRole) -> usize {
    loader
        .contexts(role)
        .into_iter()
        .filter(|id| loader.destroy(*id))
        .count()
}
