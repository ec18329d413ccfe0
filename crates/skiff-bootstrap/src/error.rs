use std::path::PathBuf;

use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::version::VersionParseError;

/// Errors that can occur while bootstrapping or tearing down a package.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A package file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A package descriptor is not valid JSON or has the wrong shape.
    #[error("Failed to parse manifest at {path}: {message}")]
    ManifestParseError {
        /// Path to the invalid descriptor.
        path: PathBuf,
        /// The parse error message.
        message: String,
    },

    /// A descriptor parsed but is missing required information.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// The package identifier cannot be turned into a domain name.
    #[error("Invalid package identifier `{id}`: {reason}")]
    InvalidIdentifier {
        /// The offending identifier.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A location string is not a valid URL or cannot be resolved.
    #[error("Invalid location `{location}`: {message}")]
    InvalidLocation {
        /// The offending location.
        location: String,
        /// The parse or resolution error.
        message: String,
    },

    /// The platform version could not be parsed.
    #[error(transparent)]
    InvalidVersion(#[from] VersionParseError),

    /// The package is already active, on this or another controller.
    #[error("Package `{0}` is already active")]
    AlreadyActive(String),

    /// An isolated context failed to load, execute or answer a call.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Options could not be serialized for the package loader.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A specialized Result type for bootstrap operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;
