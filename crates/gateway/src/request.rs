//! End-user certificate requests
//!
//! A signed-in user asks for a short-lived client certificate. The user's
//! RBAC group becomes the certificate organization, and the result is
//! returned straight to the caller. Nothing is written to disk.

use std::sync::Arc;

use lemur_common::CertMetrics;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

use crate::certs::{CertError, CertificateSource, CertificateUsage, ChainKeyPair, Manifest};

/// Body of `POST /v1/createcert`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertRequest {
    pub authority: String,
    pub common_name: String,
    pub owner: String,
    pub validity_start: String,
    pub validity_end: String,
}

impl CertRequest {
    fn missing_field(&self) -> Option<&'static str> {
        [
            ("authority", &self.authority),
            ("commonName", &self.common_name),
            ("owner", &self.owner),
            ("validityStart", &self.validity_start),
            ("validityEnd", &self.validity_end),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Certificate(#[from] CertError),
}

/// Issues client certificates through the CA
pub struct CertRequestService {
    source: Arc<dyn CertificateSource>,
    metrics: CertMetrics,
}

impl CertRequestService {
    pub fn new(source: Arc<dyn CertificateSource>, metrics: CertMetrics) -> Self {
        Self { source, metrics }
    }

    pub fn metrics(&self) -> &CertMetrics {
        &self.metrics
    }

    /// Resolve a client certificate for `rbac_group`
    pub async fn issue(
        &self,
        request: CertRequest,
        rbac_group: &str,
    ) -> Result<ChainKeyPair, IssueError> {
        self.metrics.record_request();

        if let Some(field) = request.missing_field() {
            self.metrics.record_error();
            return Err(IssueError::InvalidRequest(format!("{} is required", field)));
        }
        if rbac_group.trim().is_empty() {
            self.metrics.record_error();
            return Err(IssueError::InvalidRequest("rbac group is required".into()));
        }

        let manifest = Manifest::builder(request.authority, request.common_name, request.owner)
            .validity(request.validity_start, request.validity_end)
            .organization(rbac_group)
            .usage(CertificateUsage::Client)
            .build();

        match self.source.resolve(&manifest).await {
            Ok(pair) => {
                self.metrics.record_issued();
                info!(
                    common_name = %manifest.common_name(),
                    rbac_group = %rbac_group,
                    "Issued client certificate"
                );
                Ok(pair)
            }
            Err(e) => {
                self.metrics.record_error();
                error!(
                    common_name = %manifest.common_name(),
                    error = %e,
                    "Client certificate request failed"
                );
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for CertRequestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRequestService").finish_non_exhaustive()
    }
}
