//! Package identifier → alias domain derivation.
//!
//! Every activated package gets its own `resource://<domain>/` alias, so
//! the domain has to be unique per package and valid as a URL host.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BootstrapError, BootstrapResult};

static BRACED_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\}$")
        .expect("invalid regex")
});

/// Derive the alias domain for a package identifier.
///
/// The identifier is lowercased, `@` becomes `-at-` and `.` becomes
/// `-dot-`. A braced UUID (`{xxxxxxxx-...}`) is reduced to its hex body.
///
/// # Errors
///
/// Returns [`BootstrapError::InvalidIdentifier`] if the identifier is
/// empty, is brace-wrapped without being a well-formed UUID, or contains
/// characters that cannot appear in a URL host.
pub fn derive_domain(id: &str) -> BootstrapResult<String> {
    let invalid = |reason: &str| BootstrapError::InvalidIdentifier {
        id: id.to_owned(),
        reason: reason.to_owned(),
    };

    if id.is_empty() {
        return Err(invalid("identifier must not be empty"));
    }

    let lowered = id.to_lowercase();
    if lowered.starts_with('{') || lowered.ends_with('}') {
        return BRACED_UUID
            .captures(&lowered)
            .and_then(|caps| caps.get(1))
            .map(|body| body.as_str().to_owned())
            .ok_or_else(|| invalid("braced identifier is not a well-formed UUID"));
    }

    let domain = lowered.replace('@', "-at-").replace('.', "-dot-");
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "identifier may only contain ASCII letters, digits, '-', '_', '.' and '@'",
        ));
    }
    Ok(domain)
}
