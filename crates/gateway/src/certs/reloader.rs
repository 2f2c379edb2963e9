//! Hot-reloadable serving certificate
//!
//! [`KeypairReloader`] owns the certificate every TLS handshake is answered
//! with. The active value lives behind an [`ArcSwap`]: handshakes take a
//! lock-free snapshot, and a refresh publishes a complete replacement in a
//! single store. A reader therefore sees either the old or the new
//! certificate, never parts of both.
//!
//! Refreshing always goes CA -> disk -> memory. The in-memory swap only
//! happens after both files were written and loaded back successfully.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use lemur_common::CertMetrics;
use lemur_config::{CertificateConfig, Config};
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, error, info};

use super::client::CertificateSource;
use super::error::CertError;
use super::manifest::{CertificateUsage, Manifest, SERVER_CERT_LABEL};
use super::storage::{CertificateFiles, LoadedCertificate, Validity};

/// The certificate currently served
#[derive(Debug)]
pub struct ActiveCertificate {
    certified_key: Arc<CertifiedKey>,
    validity: Validity,
    loaded_at: DateTime<Utc>,
}

impl ActiveCertificate {
    fn new(loaded: LoadedCertificate) -> Self {
        Self {
            certified_key: loaded.certified_key,
            validity: loaded.validity,
            loaded_at: Utc::now(),
        }
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// First day of the current UTC month through `days` later.
///
/// Every refresh within one month builds the same manifest.
pub fn validity_window(now: DateTime<Utc>, days: u32) -> (NaiveDate, NaiveDate) {
    let today = now.date_naive();
    let start = today.with_day(1).unwrap_or(today);
    let end = start
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);
    (start, end)
}

/// Owner of the live serving certificate
pub struct KeypairReloader {
    files: CertificateFiles,
    identity: CertificateConfig,
    validity_days: u32,
    lookahead: Duration,
    source: Arc<dyn CertificateSource>,
    metrics: CertMetrics,
    active: ArcSwap<ActiveCertificate>,
    swap: Mutex<()>,
}

impl KeypairReloader {
    /// Obtain the first certificate from the CA and persist it.
    ///
    /// Fails when that first certificate cannot be obtained; the gateway
    /// must not start without one.
    pub async fn new(
        config: &Config,
        source: Arc<dyn CertificateSource>,
        metrics: CertMetrics,
    ) -> Result<Self, CertError> {
        let files = CertificateFiles::from_config(&config.tls);
        let identity = config.certificate.clone();
        let manifest = server_manifest(&identity, config.tls.validity_days, Utc::now());

        info!(
            common_name = %manifest.common_name(),
            authority = %manifest.authority(),
            "Requesting server certificate from CA"
        );

        let loaded = match fetch(&*source, &files, &manifest).await {
            Ok(loaded) => loaded,
            Err(e) => {
                metrics.record_error();
                error!(error = %e, "Unable to initialize server certificate");
                return Err(e);
            }
        };

        info!(
            not_before = %loaded.validity.not_before,
            not_after = %loaded.validity.not_after,
            "Server certificate loaded"
        );

        Ok(Self {
            files,
            identity,
            validity_days: config.tls.validity_days,
            lookahead: config.tls.lookahead(),
            source,
            metrics,
            active: ArcSwap::from_pointee(ActiveCertificate::new(loaded)),
            swap: Mutex::new(()),
        })
    }

    /// Snapshot of the certificate currently served. Never blocks on
    /// network or disk.
    pub fn current(&self) -> Arc<ActiveCertificate> {
        self.active.load_full()
    }

    pub fn files(&self) -> &CertificateFiles {
        &self.files
    }

    pub fn lookahead(&self) -> Duration {
        self.lookahead
    }

    /// The manifest a refresh at `now` would request
    pub fn manifest_for(&self, now: DateTime<Utc>) -> Manifest {
        server_manifest(&self.identity, self.validity_days, now)
    }

    /// Whether the certificate on disk is not yet valid or expires within
    /// the look-ahead window
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> Result<bool, CertError> {
        let validity = self.files.load_validity()?;
        let refresh = validity.needs_refresh(now, self.lookahead);
        debug!(
            not_before = %validity.not_before,
            not_after = %validity.not_after,
            refresh,
            "Checked serving certificate validity"
        );
        Ok(refresh)
    }

    /// Fetch, persist and swap in a new certificate.
    ///
    /// On error the previous certificate stays active.
    pub async fn reload(&self, now: DateTime<Utc>) -> Result<Arc<ActiveCertificate>, CertError> {
        let manifest = self.manifest_for(now);
        info!(
            common_name = %manifest.common_name(),
            validity_start = %manifest.validity_start(),
            validity_end = %manifest.validity_end(),
            "Requesting server certificate from CA"
        );

        let result = match self.source.resolve(&manifest).await {
            Ok(pair) => {
                let _swap = self.swap.lock();
                self.files.save(&pair).map(|loaded| {
                    let next = Arc::new(ActiveCertificate::new(loaded));
                    self.active.store(Arc::clone(&next));
                    next
                })
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(active) => {
                self.metrics.record_refresh();
                info!(
                    not_after = %active.validity.not_after,
                    "Swapped in new server certificate"
                );
            }
            Err(e) => {
                self.metrics.record_error();
                error!(error = %e, "Requesting server certificate failed");
            }
        }
        result
    }
}

impl ResolvesServerCert for KeypairReloader {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.active.load().certified_key))
    }
}

impl fmt::Debug for KeypairReloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active.load();
        f.debug_struct("KeypairReloader")
            .field("files", &self.files)
            .field("common_name", &self.identity.common_name)
            .field("lookahead", &self.lookahead)
            .field("not_after", &active.validity.not_after)
            .finish()
    }
}

fn server_manifest(identity: &CertificateConfig, validity_days: u32, now: DateTime<Utc>) -> Manifest {
    let (start, end) = validity_window(now, validity_days);
    Manifest::builder(
        &identity.authority,
        &identity.common_name,
        &identity.owner_email,
    )
    .validity(
        start.format("%Y-%m-%d").to_string(),
        end.format("%Y-%m-%d").to_string(),
    )
    .organization(&identity.organization)
    .organizational_unit(identity.organizational_unit())
    .label(identity.description.as_deref().unwrap_or(SERVER_CERT_LABEL))
    .usage(CertificateUsage::Server)
    .build()
}

async fn fetch(
    source: &dyn CertificateSource,
    files: &CertificateFiles,
    manifest: &Manifest,
) -> Result<LoadedCertificate, CertError> {
    let pair = source.resolve(manifest).await?;
    files.save(&pair)
}
