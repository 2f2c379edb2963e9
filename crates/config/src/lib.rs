//! Configuration for the Lemur certificate gateway.
//!
//! The gateway reads a single TOML file:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! admin_listen = "0.0.0.0:8081"
//!
//! [tls]
//! cert_file = "/var/lib/lemur-gateway/server.crt"
//! key_file = "/var/lib/lemur-gateway/server.key"
//!
//! [certificate]
//! authority = "internal-ca"
//! common_name = "gateway.example.com"
//! owner_email = "secops@example.com"
//! organization = "platform"
//!
//! [ca]
//! base_url = "https://lemur.example.com/api/1"
//!
//! [auth]
//! mode = "jwt"
//! jwt_secret_env = "LEMUR_GATEWAY_JWT_SECRET"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! Listener addresses can be overridden from the command line or the
//! `HOST_PORT` / `ADMIN_PORT` environment variables; see
//! [`Config::apply_listen_overrides`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use validator::Validate;

pub use lemur_common::{LogFormat, LoggingConfig};

mod sections;
pub mod validate;

pub use sections::{AuthConfig, AuthMode, CaConfig, CertificateConfig, ServerConfig, TlsConfig};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid listen override '{0}': expected a port or host:port")]
    InvalidOverride(String),
}

/// Full instance configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub tls: TlsConfig,

    #[validate(nested)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ca: CaConfig,

    #[serde(default)]
    #[validate(nested)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply listener overrides from the CLI or environment.
    ///
    /// Each value may be a bare port (`"9443"`, kept on the configured host)
    /// or a full socket address.
    pub fn apply_listen_overrides(
        &mut self,
        listen: Option<&str>,
        admin_listen: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = listen {
            self.server.listen = override_addr(self.server.listen, value)?;
        }
        if let Some(value) = admin_listen {
            self.server.admin_listen = override_addr(self.server.admin_listen, value)?;
        }
        Ok(())
    }

    /// Validate field values and fix up listener collisions.
    ///
    /// When the application and admin listeners share a port, the admin
    /// listener is moved to the next port up.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.server.listen.port() == self.server.admin_listen.port() {
            let port = self.server.listen.port();
            let admin_port = port.checked_add(1).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "application and admin listeners share port {} and no next port exists",
                    port
                ))
            })?;
            warn!(
                port,
                admin_port, "Cannot serve application and admin on the same port, moving admin"
            );
            self.server.admin_listen.set_port(admin_port);
        }

        Ok(self)
    }
}

fn override_addr(current: SocketAddr, value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim().trim_start_matches(':');
    if let Ok(port) = value.parse::<u16>() {
        let mut addr = current;
        addr.set_port(port);
        return Ok(addr);
    }
    value
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidOverride(value.to_string()))
}
