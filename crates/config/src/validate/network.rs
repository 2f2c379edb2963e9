//! CA reachability
//!
//! Only opens a TCP connection to the CA host. Credentials are not checked
//! here; the startup reload does that for real.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Check that the CA's host accepts TCP connections
pub async fn validate_ca_reachable(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let url = match Url::parse(&config.ca.base_url) {
        Ok(url) => url,
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Configuration,
                format!("CA base url '{}' is invalid: {}", config.ca.base_url, e),
            ));
            return result;
        }
    };

    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        result.add_error(ValidationError::new(
            ErrorCategory::Configuration,
            format!("CA base url '{}' has no host or port", config.ca.base_url),
        ));
        return result;
    };

    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("CA at {}:{} unreachable: {}", host, port, e),
            ));
        }
        Err(_) => {
            result.add_warning(ValidationWarning::new(format!(
                "CA at {}:{} connection timeout ({}s)",
                host,
                port,
                CONNECT_TIMEOUT.as_secs()
            )));
        }
    }

    result
}
