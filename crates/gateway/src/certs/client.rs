//! Lemur CA client
//!
//! Resolves a [`Manifest`] into certificate material with get-or-create
//! semantics:
//!
//! 1. `GET /certificates` filtered by the manifest description, newest first
//! 2. `POST /certificates` with the manifest when nothing matched
//! 3. `GET /certificates/{id}/key` for the private key
//!
//! Every call except the login carries `Authorization: Bearer <token>`.
//! Nothing is retried here; callers decide when to try again.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lemur_common::CertificateId;
use lemur_config::CaConfig;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use url::Url;

use super::error::CertError;
use super::manifest::Manifest;

const LOGIN_PATH: &str = "/auth/login";
const CERTIFICATES_PATH: &str = "/certificates";

/// Anything that can turn a manifest into certificate material
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn resolve(&self, manifest: &Manifest) -> Result<ChainKeyPair, CertError>;
}

/// Certificate chain, leaf certificate and private key, all PEM
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKeyPair {
    pub chain: String,
    #[serde(rename = "pubcert")]
    pub certificate: String,
    #[serde(rename = "privatekey")]
    pub private_key: String,
}

impl fmt::Debug for ChainKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKeyPair")
            .field("chain_len", &self.chain.len())
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A certificate record as the CA reports it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CertificateRecord {
    pub id: CertificateId,
    #[serde(default)]
    pub chain: Option<String>,
    pub body: String,
    #[serde(rename = "dateCreated", alias = "date_created", default)]
    pub created: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One page of search results
#[derive(Debug, Clone, Deserialize)]
pub struct CertificatePage {
    pub total: u64,
    #[serde(default)]
    pub items: Vec<CertificateRecord>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Where CA credentials come from
#[derive(Clone)]
pub enum CredentialSource {
    /// Read from the named environment variables on every login
    Environment { user_var: String, password_var: String },
    /// Fixed credentials
    Static { username: String, password: String },
}

impl CredentialSource {
    fn load(&self) -> Result<(String, String), CertError> {
        match self {
            Self::Environment {
                user_var,
                password_var,
            } => {
                let user = std::env::var(user_var).unwrap_or_default();
                let password = std::env::var(password_var).ok();
                match (user.is_empty(), password) {
                    (false, Some(password)) => Ok((user, password)),
                    _ => Err(CertError::Configuration(format!(
                        "{}|{} environment variable(s) not set. Cannot continue.",
                        user_var, password_var
                    ))),
                }
            }
            Self::Static { username, password } => Ok((username.clone(), password.clone())),
        }
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment {
                user_var,
                password_var,
            } => f
                .debug_struct("Environment")
                .field("user_var", user_var)
                .field("password_var", password_var)
                .finish(),
            Self::Static { username, .. } => f
                .debug_struct("Static")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Bearer token and when it was obtained
#[derive(Clone)]
struct AuthSession {
    token: String,
    obtained: Instant,
}

impl AuthSession {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.obtained.elapsed() < ttl
    }
}

/// HTTP client for the Lemur API.
///
/// One instance is shared by the reloader and the request service. The
/// bearer token is reused until it is older than the configured session TTL.
/// Resolves of the same manifest are serialized so two concurrent callers
/// cannot both create it.
pub struct CaClient {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialSource,
    session: Mutex<Option<AuthSession>>,
    session_ttl: Duration,
    request_timeout: Duration,
    resolving: DashMap<String, Arc<Mutex<()>>>,
}

impl CaClient {
    pub fn new(config: &CaConfig) -> Result<Self, CertError> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            CertError::Configuration(format!("invalid CA base url '{}': {}", config.base_url, e))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("lemur-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CertError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            credentials: CredentialSource::Environment {
                user_var: config.user_env.clone(),
                password_var: config.password_env.clone(),
            },
            session: Mutex::new(None),
            session_ttl: config.session_ttl(),
            request_timeout: config.request_timeout(),
            resolving: DashMap::new(),
        })
    }

    /// Replace the credential source
    pub fn with_credentials(mut self, credentials: CredentialSource) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Every CA request is JSON; `.json()` keeps an existing content type
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// Return a bearer token, logging in if none is held or it has aged out
    pub async fn authenticate(&self) -> Result<String, CertError> {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.is_fresh(self.session_ttl) {
                trace!("Reusing CA session");
                return Ok(current.token.clone());
            }
            debug!(
                ttl_secs = self.session_ttl.as_secs(),
                "CA session expired, logging in again"
            );
        }

        let (username, password) = self.credentials.load()?;
        let url = self.url(LOGIN_PATH);
        let request = self.request(Method::POST, &url).json(&LoginRequest {
            username: &username,
            password: &password,
        });
        let response: TokenResponse = self.execute(request, &url).await?;

        info!(user = %username, "Authenticated against CA");
        *session = Some(AuthSession {
            token: response.token.clone(),
            obtained: Instant::now(),
        });
        Ok(response.token)
    }

    /// Search for certificates whose description matches exactly
    pub async fn search(&self, description: &str) -> Result<CertificatePage, CertError> {
        let token = self.authenticate().await?;
        let url = self.url(CERTIFICATES_PATH);
        let filter = format!("description;{}", description);
        let request = self
            .request(Method::GET, &url)
            .query(&[
                ("sortBy", "date_created"),
                ("sortDir", "desc"),
                ("filter", filter.as_str()),
            ])
            .bearer_auth(token);

        debug!(url = %url, filter = %filter, "Searching CA for certificate");
        self.execute(request, &url).await
    }

    /// Ask the CA to issue a certificate for the manifest
    pub async fn create(&self, manifest: &Manifest) -> Result<CertificateRecord, CertError> {
        let token = self.authenticate().await?;
        let url = self.url(CERTIFICATES_PATH);
        let request = self
            .request(Method::POST, &url)
            .json(manifest)
            .bearer_auth(token);

        info!(
            url = %url,
            common_name = %manifest.common_name(),
            digest = %manifest.digest(),
            "Requesting new certificate from CA"
        );
        self.execute(request, &url).await
    }

    /// Fetch the private key of a certificate record
    pub async fn get_key(&self, id: CertificateId) -> Result<String, CertError> {
        let token = self.authenticate().await?;
        let url = self.url(&format!("{}/{}/key", CERTIFICATES_PATH, id));
        let request = self.request(Method::GET, &url).bearer_auth(token);

        let response: KeyResponse = self.execute(request, &url).await?;
        Ok(response.key)
    }

    /// Return the newest certificate matching the manifest, creating one when
    /// none exists, together with its private key.
    pub async fn resolve_certificate(&self, manifest: &Manifest) -> Result<ChainKeyPair, CertError> {
        let digest = manifest.digest().as_str().to_string();
        let lock = self.resolving.entry(digest.clone()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(manifest).await
        };

        // Forget the lock once nobody else is waiting on it
        drop(lock);
        self.resolving
            .remove_if(&digest, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn resolve_locked(&self, manifest: &Manifest) -> Result<ChainKeyPair, CertError> {
        self.authenticate().await?;

        let page = self.search(manifest.description()).await?;
        let record = if page.total < 1 {
            info!(
                digest = %manifest.digest(),
                "No certificate matching manifest exists yet, creating one"
            );
            self.create(manifest).await?
        } else {
            debug!(
                digest = %manifest.digest(),
                total = page.total,
                "Certificate matching manifest exists, using the newest"
            );
            page.items.into_iter().next().ok_or_else(|| {
                CertError::malformed(
                    self.url(CERTIFICATES_PATH),
                    format!("total is {} but items is empty", page.total),
                )
            })?
        };

        let key = self.get_key(record.id).await?;
        info!(
            id = %record.id,
            common_name = %manifest.common_name(),
            "Resolved certificate"
        );

        Ok(ChainKeyPair {
            chain: record.chain.unwrap_or_default(),
            certificate: record.body,
            private_key: key,
        })
    }

    /// Send a request and decode a JSON body. Any 2xx or 3xx status is
    /// success.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, CertError> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(url, e))?;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            let body = response.text().await.unwrap_or_default();
            return Err(CertError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(url, e))?;
        serde_json::from_slice(&bytes).map_err(|e| CertError::malformed(url, e))
    }

    fn transport_error(&self, url: &str, error: reqwest::Error) -> CertError {
        if error.is_timeout() {
            CertError::Timeout {
                url: url.to_string(),
                after: self.request_timeout,
            }
        } else {
            CertError::Network {
                url: url.to_string(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl CertificateSource for CaClient {
    async fn resolve(&self, manifest: &Manifest) -> Result<ChainKeyPair, CertError> {
        self.resolve_certificate(manifest).await
    }
}

impl fmt::Debug for CaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("session_ttl", &self.session_ttl)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decodes_large_ids_and_optional_fields() {
        let record: CertificateRecord = serde_json::from_str(
            r#"{"id": 9007199254740993, "body": "BODY", "dateCreated": "2024-01-01T00:00:00"}"#,
        )
        .unwrap();

        assert_eq!(record.id.get(), 9_007_199_254_740_993);
        assert_eq!(record.chain, None);
        assert_eq!(record.created.as_deref(), Some("2024-01-01T00:00:00"));
    }

    #[test]
    fn test_page_without_items_defaults_to_empty() {
        let page: CertificatePage = serde_json::from_str(r#"{"total": 0}"#).unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_record_with_string_id_is_rejected() {
        let result = serde_json::from_str::<CertificateRecord>(r#"{"id": "42", "body": "B"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_chain_key_pair_wire_names_and_redaction() {
        let pair = ChainKeyPair {
            chain: "CHAIN".into(),
            certificate: "BODY".into(),
            private_key: "SECRET".into(),
        };
        let value = serde_json::to_value(&pair).unwrap();
        assert_eq!(value["pubcert"], "BODY");
        assert_eq!(value["privatekey"], "SECRET");
        assert!(!format!("{:?}", pair).contains("SECRET"));
    }

    #[test]
    fn test_missing_environment_credentials() {
        let source = CredentialSource::Environment {
            user_var: "LEMUR_GATEWAY_TEST_UNSET_USER".into(),
            password_var: "LEMUR_GATEWAY_TEST_UNSET_PASS".into(),
        };
        let err = source.load().unwrap_err();
        assert!(matches!(err, CertError::Configuration(_)));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let config = CaConfig {
            base_url: "https://lemur.example.com/api/1/".into(),
            ..Default::default()
        };
        let client = CaClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://lemur.example.com/api/1");
        assert_eq!(
            client.url(CERTIFICATES_PATH),
            "https://lemur.example.com/api/1/certificates"
        );
    }

    #[test]
    fn test_invalid_base_url_is_configuration_error() {
        let config = CaConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            CaClient::new(&config),
            Err(CertError::Configuration(_))
        ));
    }

    #[test]
    fn test_session_freshness() {
        let session = AuthSession {
            token: "t".into(),
            obtained: Instant::now(),
        };
        assert!(session.is_fresh(Duration::from_secs(60)));
        assert!(!session.is_fresh(Duration::ZERO));
    }
}
