//! Certificate lifecycle errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Broad class of a [`CertError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing credentials or unusable settings
    Configuration,
    /// The CA answered, but not with something usable
    Protocol,
    /// The CA could not be reached in time
    Network,
    /// Certificate files could not be written or loaded back
    Persistence,
}

/// Errors raised while requesting, storing or loading certificates
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Bad response ({status}) from request ({url}), response body: '{body}'")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("Request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {url} timed out after {}s", after.as_secs())]
    Timeout { url: String, after: Duration },

    #[error("Certificate file {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid certificate material: {0}")]
    InvalidCertificate(String),
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Status { .. } | Self::MalformedResponse { .. } => ErrorKind::Protocol,
            Self::Network { .. } | Self::Timeout { .. } => ErrorKind::Network,
            Self::Persistence { .. } | Self::InvalidCertificate(_) => ErrorKind::Persistence,
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
