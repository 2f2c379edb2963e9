//! Caller authentication for certificate requests
//!
//! The RBAC group of an issued certificate is taken from whatever the
//! [`Authenticator`] vouches for, never from the request body. Which
//! authenticator runs is chosen by `[auth] mode`:
//!
//! - `disabled` (default) - [`DenyAll`], every request is refused
//! - `jwt` - [`JwtAuthenticator`], HS256 bearer token with an `rbac` claim
//! - `trusted_header` - [`TrustedHeader`], for deployments behind a proxy
//!   that sets `x-rbac-group` itself

use std::sync::Arc;

use chrono::{Duration, Utc};
use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use lemur_config::{AuthConfig, AuthMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Header read by [`TrustedHeader`]
pub const RBAC_GROUP_HEADER: &str = "x-rbac-group";

const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("certificate requests are disabled")]
    Disabled,

    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token has no {0} claim")]
    MissingClaim(&'static str),

    #[error("{0}")]
    Configuration(String),
}

/// Who is asking, as vouched for by an [`Authenticator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: Option<String>,
    pub rbac_group: String,
}

/// Decides whether a request may ask for a certificate, and for which group
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}

/// Build the authenticator selected by `config.mode`
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn Authenticator>, AuthError> {
    match config.mode {
        AuthMode::Disabled => {
            warn!("Certificate request authentication is disabled, all requests will be refused");
            Ok(Arc::new(DenyAll))
        }
        AuthMode::Jwt => {
            let secret = std::env::var(&config.jwt_secret_env).map_err(|_| {
                AuthError::Configuration(format!(
                    "{} environment variable not set. Cannot continue.",
                    config.jwt_secret_env
                ))
            })?;
            info!(
                secret_env = %config.jwt_secret_env,
                "Authenticating certificate requests with JWT"
            );
            Ok(Arc::new(JwtAuthenticator::new(secret.as_bytes())?))
        }
        AuthMode::TrustedHeader => {
            warn!(
                header = RBAC_GROUP_HEADER,
                "Trusting RBAC group header; the application listener must sit behind a proxy that sets it"
            );
            Ok(Arc::new(TrustedHeader))
        }
    }
}

/// Refuses everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<Principal, AuthError> {
        Err(AuthError::Disabled)
    }
}

/// Claims of a gateway session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<String>,
    pub exp: i64,
}

/// HS256 session tokens, sent as `Authorization: Bearer <token>`.
///
/// The bare token without the `Bearer` scheme is accepted too.
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(AuthError::Configuration(format!(
                "JWT secret must be at least {} bytes",
                MIN_SECRET_BYTES
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Sign a session token for `username` in `rbac_group`
    pub fn issue(
        &self,
        username: &str,
        rbac_group: &str,
        validity: Duration,
    ) -> Result<String, AuthError> {
        let claims = SessionClaims {
            username: username.to_string(),
            rbac: Some(rbac_group.to_string()),
            exp: (Utc::now() + validity).timestamp(),
        };
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        Ok(decode::<SessionClaims>(token, &self.decoding_key, &self.validation)?.claims)
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();

        let claims = self.validate(token)?;
        let rbac_group = claims
            .rbac
            .filter(|group| !group.trim().is_empty())
            .ok_or(AuthError::MissingClaim("rbac"))?;

        Ok(Principal {
            username: Some(claims.username),
            rbac_group,
        })
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator").finish_non_exhaustive()
    }
}

/// Takes the group from [`RBAC_GROUP_HEADER`] as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedHeader;

impl Authenticator for TrustedHeader {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let rbac_group = headers
            .get(RBAC_GROUP_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCredentials)?;

        Ok(Principal {
            username: None,
            rbac_group: rbac_group.to_string(),
        })
    }
}
