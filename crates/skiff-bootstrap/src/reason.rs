//! Lifecycle reason codes.
//!
//! Hosts pass reasons by numeric index; everything inside the bootstrap
//! works with the named [`LoadReason`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The cause of an activation or deactivation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadReason {
    /// Reason code outside the known range.
    Unknown,
    /// The host application is starting.
    Startup,
    /// The host application is terminating.
    Shutdown,
    /// The package was enabled.
    Enable,
    /// The package was disabled.
    Disable,
    /// The package was installed.
    Install,
    /// The package was uninstalled.
    Uninstall,
    /// The package was replaced by a newer version.
    Upgrade,
    /// The package was replaced by an older version.
    Downgrade,
}

impl LoadReason {
    /// All reasons, indexed by their numeric code.
    pub const ALL: [Self; 9] = [
        Self::Unknown,
        Self::Startup,
        Self::Shutdown,
        Self::Enable,
        Self::Disable,
        Self::Install,
        Self::Uninstall,
        Self::Upgrade,
        Self::Downgrade,
    ];

    /// Translate a host reason code. Out-of-range codes map to `Unknown`.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(Self::Unknown)
    }

    /// The numeric code the host uses for this reason.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Startup => 1,
            Self::Shutdown => 2,
            Self::Enable => 3,
            Self::Disable => 4,
            Self::Install => 5,
            Self::Uninstall => 6,
            Self::Upgrade => 7,
            Self::Downgrade => 8,
        }
    }

    /// The lowercase name handed to the package loader.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
        }
    }

    /// Whether the whole host process is going away.
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        self == Self::Shutdown
    }
}

impl fmt::Display for LoadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LoadReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::ALL
            .into_iter()
            .find(|reason| reason.name() == s)
            .unwrap_or(Self::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_to_names() {
        assert_eq!(LoadReason::from_code(1), LoadReason::Startup);
        assert_eq!(LoadReason::from_code(2).name(), "shutdown");
        assert_eq!(LoadReason::from_code(8), LoadReason::Downgrade);
        for reason in LoadReason::ALL {
            assert_eq!(LoadReason::from_code(reason.code()), reason);
        }
    }

    #[test]
    fn test_out_of_range_code_is_unknown() {
        assert_eq!(LoadReason::from_code(9), LoadReason::Unknown);
        assert_eq!(LoadReason::from_code(u32::MAX), LoadReason::Unknown);
    }

    #[test]
    fn test_parse_by_name() {
        assert_eq!("disable".parse::<LoadReason>().unwrap(), LoadReason::Disable);
        assert_eq!("bogus".parse::<LoadReason>().unwrap(), LoadReason::Unknown);
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&LoadReason::Upgrade).unwrap();
        assert_eq!(json, "\"upgrade\"");
    }
}
