//! Process-wide `resource://` alias registry.
//!
//! An alias maps a host name (`resource://<host>/`) to a concrete base
//! location, usually a `file://` directory. Packages register their own
//! domain plus one alias per preference override; all names are derived
//! from the package domain so independently activated packages never
//! collide.
//!
//! A domain is also claimed by the controller running it, so two
//! controllers sharing a registry cannot run the same package at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;
use url::Url;

use crate::error::{BootstrapError, BootstrapResult};

/// Scheme used for aliased locations.
pub const RESOURCE_SCHEME: &str = "resource";

/// Alias host of the platform's shared module root.
pub const PLATFORM_DOMAIN: &str = "platform";

/// Alias chains longer than this are treated as cycles.
const MAX_ALIAS_DEPTH: usize = 8;

/// Shared handle to the alias table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct AliasRegistry {
    inner: Arc<RwLock<BTreeMap<String, Url>>>,
    claims: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl AliasRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `resource://<host>/` to `target`, replacing any previous alias.
    pub fn set_substitution(&self, host: impl Into<String>, target: Url) {
        let host = host.into();
        debug!(alias = %host, target = %target, "Registered resource alias");
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, target);
    }

    /// Remove an alias, returning its target.
    pub fn remove(&self, host: &str) -> Option<Url> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host)
    }

    /// Remove every alias owned by a package domain: the domain itself and
    /// all of its preference override aliases.
    pub fn remove_domain(&self, domain: &str) -> usize {
        let override_prefix = override_alias_prefix(domain);
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.retain(|host, _| host != domain && !host.starts_with(&override_prefix));
        let removed = before.saturating_sub(table.len());
        debug!(domain, removed, "Removed package resource aliases");
        removed
    }

    /// Claim `domain` for the controller `owner`.
    ///
    /// Returns `false` if another controller holds it. Claiming a domain
    /// already held by `owner` succeeds.
    pub fn claim_domain(&self, domain: &str, owner: u64) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(domain) {
            Some(holder) if *holder != owner => {
                debug!(domain, owner, holder = *holder, "Domain already claimed");
                false
            },
            _ => {
                claims.insert(domain.to_owned(), owner);
                true
            },
        }
    }

    /// Release a claim. Claims held by other controllers are left alone.
    pub fn release_domain(&self, domain: &str, owner: u64) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.get(domain) == Some(&owner) {
            claims.remove(domain);
            true
        } else {
            false
        }
    }

    /// The controller currently holding `domain`.
    #[must_use]
    pub fn domain_owner(&self, domain: &str) -> Option<u64> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .copied()
    }

    /// Look up the target of an alias.
    #[must_use]
    pub fn get(&self, host: &str) -> Option<Url> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }

    /// Whether an alias is registered.
    #[must_use]
    pub fn contains(&self, host: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(host)
    }

    /// Resolve a location to a concrete (non-`resource`) URL by following
    /// aliases. Non-`resource` locations are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::InvalidLocation`] if an alias is missing,
    /// the chain is too long, or the remaining path cannot be joined.
    pub fn resolve(&self, location: &Url) -> BootstrapResult<Url> {
        let mut current = location.clone();
        for _ in 0..MAX_ALIAS_DEPTH {
            if current.scheme() != RESOURCE_SCHEME {
                return Ok(current);
            }
            let host = current.host_str().unwrap_or_default().to_owned();
            let target = self.get(&host).ok_or_else(|| BootstrapError::InvalidLocation {
                location: location.to_string(),
                message: format!("no resource alias registered for `{host}`"),
            })?;
            let rest = current.path().trim_start_matches('/');
            current = target
                .join(rest)
                .map_err(|e| BootstrapError::InvalidLocation {
                    location: location.to_string(),
                    message: e.to_string(),
                })?;
        }
        Err(BootstrapError::InvalidLocation {
            location: location.to_string(),
            message: format!("alias chain longer than {MAX_ALIAS_DEPTH}"),
        })
    }
}

/// Prefix shared by every preference override alias of a domain.
#[must_use]
pub fn override_alias_prefix(domain: &str) -> String {
    format!("extensions.modules.{domain}.commonjs.path")
}

/// Build `resource://<host>/`.
///
/// # Errors
///
/// Returns [`BootstrapError::InvalidLocation`] if `host` is not usable as a
/// URL host.
pub fn resource_root(host: &str) -> BootstrapResult<Url> {
    let raw = format!("{RESOURCE_SCHEME}://{host}/");
    Url::parse(&raw).map_err(|e| BootstrapError::InvalidLocation {
        location: raw,
        message: e.to_string(),
    })
}
