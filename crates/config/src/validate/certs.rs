//! Serving certificate inspection
//!
//! The gateway always asks the CA for its certificate at startup, so a
//! missing or expired file is not fatal. A file that exists but cannot be
//! parsed usually means the path points at the wrong thing.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Inspect the configured certificate and key files
pub async fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let tls = &config.tls;

    if !tls.cert_file.exists() {
        result.add_warning(ValidationWarning::new(format!(
            "Certificate not found: {:?} (it will be requested from the CA at startup)",
            tls.cert_file
        )));
        return result;
    }

    if !tls.key_file.exists() {
        result.add_warning(ValidationWarning::new(format!(
            "Private key not found: {:?} (it will be requested from the CA at startup)",
            tls.key_file
        )));
    }

    match inspect_cert(&tls.cert_file, tls.lookahead()) {
        Ok(Some(warning)) => result.add_warning(warning),
        Ok(None) => {}
        Err(e) => result.add_error(e),
    }

    result
}

/// Load a certificate and compare its validity window with the look-ahead
fn inspect_cert(
    cert_path: &Path,
    lookahead: Duration,
) -> Result<Option<ValidationWarning>, ValidationError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    let now = SystemTime::now();
    let not_after = SystemTime::UNIX_EPOCH
        + Duration::from_secs(cert.validity().not_after.timestamp().max(0) as u64);

    if not_after < now {
        return Ok(Some(ValidationWarning::new(format!(
            "Certificate expired: {:?} (expired at {}), it will be replaced at startup",
            cert_path,
            cert.validity().not_after
        ))));
    }

    if not_after < now + lookahead {
        return Ok(Some(ValidationWarning::new(format!(
            "Certificate expires within the refresh look-ahead: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}
