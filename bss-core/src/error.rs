//! Error types for bss-core.
//!
//! The cycle-level taxonomy ([`FetchError`], [`PublishError`]) lives here so
//! that the upstream client and the sync driver agree on it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failed upstream fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchErrorKind {
    Network,
    Auth,
    Malformed,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Network => write!(f, "network"),
            FetchErrorKind::Auth => write!(f, "auth"),
            FetchErrorKind::Malformed => write!(f, "malformed"),
        }
    }
}

/// An upstream query that produced no usable batch.
///
/// Individual malformed records inside an otherwise valid batch are not
/// errors; they are dropped and counted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, timeout, or a non-auth HTTP failure.
    #[error("scheduling service unreachable: {0}")]
    Network(String),

    /// Credentials missing, invalid, or not authorized for this beamline.
    #[error("scheduling service refused credentials: {0}")]
    Auth(String),

    /// The response body could not be interpreted as a list of records.
    #[error("malformed response from scheduling service: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_) => FetchErrorKind::Network,
            FetchError::Auth(_) => FetchErrorKind::Auth,
            FetchError::Malformed(_) => FetchErrorKind::Malformed,
        }
    }
}

/// A field write refused by the broadcast mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broadcast layer accepted the connection but refused this value.
    #[error("write to {handle} rejected: {reason}")]
    Rejected { handle: String, reason: String },

    /// The broadcast layer could not be reached at all.
    #[error("broadcast layer unreachable: {0}")]
    Unreachable(String),
}

/// Start-up configuration failures. Fatal before the sync loop begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `sector` configured and none derivable from the beamline name.
    #[error("no sector configured and none derivable from beamline {beamline:?}")]
    MissingSector { beamline: Option<String> },

    /// A duration setting that must be positive (or ordered) is not.
    #[error("invalid {name}: {value}")]
    InvalidInterval { name: &'static str, value: u64 },

    /// The configuration file did not exist at the expected path.
    #[error("configuration not found at {path}; run `apsbss init` first")]
    NotFound { path: PathBuf },

    /// YAML parse error on load, with the offending path.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Credentials file present in the configuration but unreadable or empty.
    #[error("unusable credentials file {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Text that is not any of the accepted timestamp layouts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized timestamp {text:?}")]
pub struct TimestampError {
    pub text: String,
}
