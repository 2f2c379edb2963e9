//! Extended configuration validation for `lemur-gateway --test`.
//!
//! [`Config::validated`](crate::Config::validated) only checks field values.
//! The checks here look at the world around the configuration: certificate
//! files already on disk, whether the CA is reachable, and settings that are
//! legal but likely to cause trouble in production.

mod lint;

#[cfg(feature = "validation")]
mod certs;
#[cfg(feature = "validation")]
mod network;

pub use lint::lint_config;

#[cfg(feature = "validation")]
pub use certs::validate_certificates;
#[cfg(feature = "validation")]
pub use network::validate_ca_reachable;

use std::fmt;

#[cfg(feature = "validation")]
use crate::Config;

/// What a validation error is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Certificate,
    Network,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Certificate => write!(f, "certificate"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// A problem that must be fixed before the gateway can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Something worth a look that does not stop the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Accumulated errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every check: lint, on-disk certificates and CA reachability
#[cfg(feature = "validation")]
pub async fn validate_full(config: &Config) -> ValidationResult {
    let mut result = lint_config(config);
    result.merge(validate_certificates(config).await);
    result.merge(validate_ca_reachable(config).await);
    result
}
