//! Configuration sections and their defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

// ============================================================================
// Server
// ============================================================================

/// Listener addresses for the application and admin interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Application listener (certificate requests)
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Admin listener (ping, healthcheck, metrics)
    #[serde(default = "default_admin_listen")]
    pub admin_listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_admin_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8081))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

// ============================================================================
// TLS
// ============================================================================

/// Where the serving certificate lives on disk and how it is kept fresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TlsConfig {
    /// PEM certificate (leaf followed by chain)
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    /// PEM private key
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// How often the on-disk certificate is checked
    #[serde(default = "default_refresh_interval_secs")]
    #[validate(range(min = 60))]
    pub refresh_interval_secs: u64,

    /// Refresh when the certificate expires within this window
    #[serde(default = "default_lookahead_secs")]
    #[validate(range(min = 1))]
    pub lookahead_secs: u64,

    /// Length of the validity window requested for the serving certificate
    #[serde(default = "default_validity_days")]
    #[validate(range(min = 1, max = 3650))]
    pub validity_days: u32,
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("server.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("server.key")
}

fn default_refresh_interval_secs() -> u64 {
    24 * 3600
}

fn default_lookahead_secs() -> u64 {
    24 * 3600
}

fn default_validity_days() -> u32 {
    730
}

impl TlsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_secs(self.lookahead_secs)
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            refresh_interval_secs: default_refresh_interval_secs(),
            lookahead_secs: default_lookahead_secs(),
            validity_days: default_validity_days(),
        }
    }
}

// ============================================================================
// Certificate identity
// ============================================================================

/// Identity of the gateway's own serving certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CertificateConfig {
    /// Name of the issuing authority inside the CA
    #[validate(length(min = 1, message = "invalid cert authority"))]
    pub authority: String,

    #[validate(length(min = 1, message = "invalid common name"))]
    pub common_name: String,

    #[validate(email(message = "invalid email address"))]
    pub owner_email: String,

    #[validate(length(min = 1, message = "invalid certificate org"))]
    pub organization: String,

    /// Defaults to `organization` when unset
    #[serde(default)]
    pub organizational_unit: Option<String>,

    /// Human readable label stored after the digest
    #[serde(default)]
    pub description: Option<String>,
}

impl CertificateConfig {
    pub fn organizational_unit(&self) -> &str {
        self.organizational_unit
            .as_deref()
            .unwrap_or(&self.organization)
    }
}

// ============================================================================
// Certificate authority
// ============================================================================

/// How to reach and authenticate against the remote CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CaConfig {
    /// API root, e.g. `https://lemur.example.com/api/1`
    #[serde(default = "default_base_url")]
    #[validate(url(message = "invalid CA base url"))]
    pub base_url: String,

    /// Environment variable holding the CA username
    #[serde(default = "default_user_env")]
    #[validate(length(min = 1))]
    pub user_env: String,

    /// Environment variable holding the CA password
    #[serde(default = "default_password_env")]
    #[validate(length(min = 1))]
    pub password_env: String,

    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// A bearer token older than this is discarded and the client logs in again
    #[serde(default = "default_session_ttl_secs")]
    #[validate(range(min = 1))]
    pub session_ttl_secs: u64,
}

fn default_base_url() -> String {
    "https://lemur.example.com/api/1".to_string()
}

fn default_user_env() -> String {
    "LEMUR_USER".to_string()
}

fn default_password_env() -> String {
    "LEMUR_PASS".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    3600
}

impl CaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_env: default_user_env(),
            password_env: default_password_env(),
            request_timeout_secs: default_request_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

// ============================================================================
// Certificate request authentication
// ============================================================================

/// How callers of `POST /v1/createcert` are authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every certificate request is refused
    #[default]
    Disabled,
    /// HS256 bearer token carrying `username` and `rbac` claims
    Jwt,
    /// Trust the `x-rbac-group` header. Only safe behind a front proxy that
    /// strips the header from client requests and sets it itself.
    TrustedHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,

    /// Environment variable holding the HMAC secret for `jwt` mode
    #[serde(default = "default_jwt_secret_env")]
    #[validate(length(min = 1))]
    pub jwt_secret_env: String,
}

fn default_jwt_secret_env() -> String {
    "LEMUR_GATEWAY_JWT_SECRET".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            jwt_secret_env: default_jwt_secret_env(),
        }
    }
}
