//! Platform version parsing and comparison.
//!
//! Host platforms use toolkit-style versions such as `21.0a1`, `20.0.1` or
//! `24.0b3` rather than strict semver. Each dot-separated part is read as
//! `<number><pre-release letters><number><rest>`. A part carrying a
//! pre-release suffix sorts before the same number without one, so
//! `21.0a1 < 21.0`. Missing trailing parts compare as zero.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The first platform version that ships the shared runtime modules.
///
/// Packages running on anything older have to use the runtime bundled
/// inside the package.
pub const BUNDLED_RUNTIME_CUTOFF: &str = "21.0a1";

/// Error returned when parsing a platform version fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    /// The version string is empty.
    #[error("platform version must not be empty")]
    Empty,
    /// A numeric segment does not fit in 64 bits.
    #[error("invalid version number `{0}` in platform version")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, Default)]
struct VersionPart {
    number: u64,
    pre: String,
    pre_number: u64,
    extra: String,
}

/// A parsed platform version.
#[derive(Debug, Clone)]
pub struct PlatformVersion {
    raw: String,
    parts: Vec<VersionPart>,
}

impl PlatformVersion {
    /// The version string as it was given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this version sorts strictly before `other`.
    #[must_use]
    pub fn predates(&self, other: &Self) -> bool {
        self < other
    }

    /// Whether this platform predates [`BUNDLED_RUNTIME_CUTOFF`].
    #[must_use]
    pub fn needs_bundled_runtime(&self) -> bool {
        BUNDLED_RUNTIME_CUTOFF
            .parse::<Self>()
            .is_ok_and(|cutoff| self.predates(&cutoff))
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn parse_number(digits: &str) -> Result<u64, VersionParseError> {
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse()
        .map_err(|_| VersionParseError::InvalidNumber(digits.to_owned()))
}

fn parse_part(raw: &str) -> Result<VersionPart, VersionParseError> {
    let (number, rest) = split_digits(raw);
    let pre_end = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
    let (pre, rest) = rest.split_at(pre_end);
    let (pre_number, extra) = split_digits(rest);

    Ok(VersionPart {
        number: parse_number(number)?,
        pre: pre.to_owned(),
        pre_number: parse_number(pre_number)?,
        extra: extra.to_owned(),
    })
}

/// Empty suffixes sort after non-empty ones (`0a` < `0`).
fn compare_suffix(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

impl VersionPart {
    fn compare(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| compare_suffix(&self.pre, &other.pre))
            .then_with(|| self.pre_number.cmp(&other.pre_number))
            .then_with(|| compare_suffix(&self.extra, &other.extra))
    }
}

impl FromStr for PlatformVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let parts = raw.split('.').map(parse_part).collect::<Result<_, _>>()?;
        Ok(Self {
            raw: raw.to_owned(),
            parts,
        })
    }
}

impl Ord for PlatformVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let zero = VersionPart::default();
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).unwrap_or(&zero);
                let b = other.parts.get(i).unwrap_or(&zero);
                a.compare(b)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for PlatformVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PlatformVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for PlatformVersion {}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
