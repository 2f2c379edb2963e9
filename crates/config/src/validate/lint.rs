//! Settings that parse and validate but are likely mistakes in production

use super::{ValidationResult, ValidationWarning};
use crate::{AuthMode, Config};

/// Lint configuration for risky but legal settings
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let tls = &config.tls;

    if tls.lookahead() < tls.refresh_interval() {
        result.add_warning(ValidationWarning::new(format!(
            "tls.lookahead_secs ({}) is shorter than tls.refresh_interval_secs ({}); \
             the serving certificate may expire between checks",
            tls.lookahead_secs, tls.refresh_interval_secs
        )));
    }

    if tls.validity_days < 30 {
        result.add_warning(ValidationWarning::new(format!(
            "tls.validity_days is {}; short-lived serving certificates cause frequent CA requests",
            tls.validity_days
        )));
    }

    if !config.ca.base_url.starts_with("https://") {
        result.add_warning(ValidationWarning::new(format!(
            "ca.base_url '{}' is not https; credentials and private keys travel in clear text",
            config.ca.base_url
        )));
    }

    if config.certificate.description.is_none() {
        result.add_warning(ValidationWarning::new(
            "certificate.description not set; serving certificates use the default label",
        ));
    }

    match config.auth.mode {
        AuthMode::Disabled => result.add_warning(ValidationWarning::new(
            "auth.mode is disabled; every certificate request will be refused",
        )),
        AuthMode::TrustedHeader => result.add_warning(ValidationWarning::new(
            "auth.mode is trusted_header; the application listener must only be reachable \
             through a proxy that overwrites x-rbac-group",
        )),
        AuthMode::Jwt => {}
    }

    result
}
