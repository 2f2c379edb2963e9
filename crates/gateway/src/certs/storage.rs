//! Serving certificate files
//!
//! The gateway keeps its certificate in two PEM files:
//!
//! ```text
//! server.crt   # leaf certificate followed by the issuing chain
//! server.key   # private key
//! ```
//!
//! New material is written next to the targets as `*.tmp`, loaded back to
//! make sure it parses and the key matches the certificate, and only then
//! renamed into place. The certificate is renamed before the key, and a
//! failed key rename puts the previous certificate back from `*.bak`. Both
//! files are owner-only (0600).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lemur_config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, error, info, trace};

use super::client::ChainKeyPair;
use super::error::CertError;

/// Validity window of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    /// True when the certificate is not valid yet, or stops being valid
    /// within `lookahead` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        let lookahead = chrono::Duration::from_std(lookahead).unwrap_or(chrono::TimeDelta::MAX);
        let threshold = now.checked_add_signed(lookahead).unwrap_or(DateTime::<Utc>::MAX_UTC);
        now < self.not_before || threshold >= self.not_after
    }
}

/// A certificate chain and key loaded into rustls form
#[derive(Debug, Clone)]
pub struct LoadedCertificate {
    pub certified_key: Arc<CertifiedKey>,
    pub validity: Validity,
}

/// Paths of the serving certificate and its key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateFiles {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn from_config(tls: &TlsConfig) -> Self {
        Self::new(&tls.cert_file, &tls.key_file)
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Write new material, validate it, then move it into place.
    ///
    /// The certificate is renamed first, then the key. If the key rename
    /// fails the previous certificate is restored, so on error the files on
    /// disk are still the previous matching pair.
    pub fn save(&self, pair: &ChainKeyPair) -> Result<LoadedCertificate, CertError> {
        let cert_tmp = sibling_path(&self.cert_path, ".tmp");
        let key_tmp = sibling_path(&self.key_path, ".tmp");

        let result = self.stage_and_commit(pair, &cert_tmp, &key_tmp);
        if result.is_err() {
            let _ = fs::remove_file(&cert_tmp);
            let _ = fs::remove_file(&key_tmp);
        }
        result
    }

    fn stage_and_commit(
        &self,
        pair: &ChainKeyPair,
        cert_tmp: &Path,
        key_tmp: &Path,
    ) -> Result<LoadedCertificate, CertError> {
        write_private(cert_tmp, certificate_pem(pair).as_bytes())?;
        write_private(key_tmp, pair.private_key.as_bytes())?;

        let loaded = load_certificate(cert_tmp, key_tmp)?;

        self.commit(cert_tmp, key_tmp)?;

        info!(
            cert_path = %self.cert_path.display(),
            not_after = %loaded.validity.not_after,
            "Saved serving certificate"
        );
        Ok(loaded)
    }

    fn commit(&self, cert_tmp: &Path, key_tmp: &Path) -> Result<(), CertError> {
        let backup = sibling_path(&self.cert_path, ".bak");
        let had_cert = self.cert_path.exists();
        if had_cert {
            fs::copy(&self.cert_path, &backup).map_err(|e| CertError::persistence(&backup, e))?;
        }

        let result = fs::rename(cert_tmp, &self.cert_path)
            .map_err(|e| CertError::persistence(&self.cert_path, e))
            .and_then(|_| {
                fs::rename(key_tmp, &self.key_path).map_err(|e| {
                    self.restore_certificate(&backup, had_cert);
                    CertError::persistence(&self.key_path, e)
                })
            });

        if had_cert {
            let _ = fs::remove_file(&backup);
        }
        result
    }

    fn restore_certificate(&self, backup: &Path, had_cert: bool) {
        let restored = if had_cert {
            fs::rename(backup, &self.cert_path)
        } else {
            fs::remove_file(&self.cert_path)
        };
        if let Err(e) = restored {
            error!(
                cert_path = %self.cert_path.display(),
                error = %e,
                "Unable to restore previous certificate, certificate and key may not match"
            );
        }
    }

    /// Load the certificate and key currently on disk
    pub fn load(&self) -> Result<LoadedCertificate, CertError> {
        load_certificate(&self.cert_path, &self.key_path)
    }

    /// Read only the validity window of the certificate on disk
    pub fn load_validity(&self) -> Result<Validity, CertError> {
        let chain = read_chain(&self.cert_path)?;
        let leaf = chain
            .first()
            .ok_or_else(|| CertError::InvalidCertificate("empty certificate chain".to_string()))?;
        let validity = parse_validity(leaf)?;
        trace!(
            cert_path = %self.cert_path.display(),
            not_before = %validity.not_before,
            not_after = %validity.not_after,
            "Read certificate validity"
        );
        Ok(validity)
    }
}

/// Leaf body, then the chain
fn certificate_pem(pair: &ChainKeyPair) -> String {
    let mut pem = pair.certificate.trim_end().to_string();
    pem.push('\n');
    let chain = pair.chain.trim();
    if !chain.is_empty() {
        pem.push_str(chain);
        pem.push('\n');
    }
    pem
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_private(path: &Path, content: &[u8]) -> Result<(), CertError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| CertError::persistence(path, e))?;

    // `mode` only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| CertError::persistence(path, e))?;
    }

    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| CertError::persistence(path, e))?;

    debug!(path = %path.display(), bytes = content.len(), "Wrote certificate file");
    Ok(())
}

fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let pem = fs::read(path).map_err(|e| CertError::persistence(path, e))?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::persistence(path, e))?;

    if chain.is_empty() {
        return Err(CertError::InvalidCertificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let pem = fs::read(path).map_err(|e| CertError::persistence(path, e))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| CertError::persistence(path, e))?
        .ok_or_else(|| {
            CertError::InvalidCertificate(format!("no private key found in {}", path.display()))
        })
}

fn load_certificate(cert_path: &Path, key_path: &Path) -> Result<LoadedCertificate, CertError> {
    let chain = read_chain(cert_path)?;
    let key = read_key(key_path)?;
    let validity = parse_validity(&chain[0])?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let certified_key = CertifiedKey::from_der(chain, key, &provider)
        .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;

    Ok(LoadedCertificate {
        certified_key: Arc::new(certified_key),
        validity,
    })
}

fn parse_validity(leaf: &CertificateDer<'_>) -> Result<Validity, CertError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertError::InvalidCertificate(format!("invalid X509 certificate: {}", e)))?;

    let to_utc = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| {
            CertError::InvalidCertificate(format!("certificate timestamp {} out of range", ts))
        })
    };

    Ok(Validity {
        not_before: to_utc(cert.validity().not_before.timestamp())?,
        not_after: to_utc(cert.validity().not_after.timestamp())?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile::TempDir;

    /// Self-signed material valid from `not_before` to `not_after`
    pub(crate) fn generate_pair(
        common_name: &str,
        not_before: time::OffsetDateTime,
        not_after: time::OffsetDateTime,
    ) -> ChainKeyPair {
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        params.not_before = not_before;
        params.not_after = not_after;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        ChainKeyPair {
            chain: String::new(),
            certificate: cert.pem(),
            private_key: key_pair.serialize_pem(),
        }
    }

    pub(crate) fn valid_pair(common_name: &str) -> ChainKeyPair {
        let now = time::OffsetDateTime::now_utc();
        generate_pair(
            common_name,
            now - time::Duration::days(1),
            now + time::Duration::days(90),
        )
    }

    fn files_in(dir: &TempDir) -> CertificateFiles {
        CertificateFiles::new(dir.path().join("server.crt"), dir.path().join("server.key"))
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        let pair = valid_pair("gateway.example.com");

        let saved = files.save(&pair).unwrap();
        let loaded = files.load().unwrap();

        assert_eq!(saved.validity, loaded.validity);
        assert_eq!(saved.certified_key.cert, loaded.certified_key.cert);
        assert!(!dir.path().join("server.crt.tmp").exists());
        assert!(!dir.path().join("server.key.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        files.save(&valid_pair("gateway.example.com")).unwrap();

        for path in [files.cert_path(), files.key_path()] {
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn test_mismatched_key_leaves_previous_files() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        let original = valid_pair("gateway.example.com");
        files.save(&original).unwrap();

        let other = valid_pair("other.example.com");
        let broken = ChainKeyPair {
            private_key: other.private_key,
            ..valid_pair("gateway.example.com")
        };
        let err = files.save(&broken).unwrap_err();

        assert!(matches!(err, CertError::InvalidCertificate(_)));
        assert_eq!(
            fs::read_to_string(files.key_path()).unwrap(),
            original.private_key
        );
        assert!(!dir.path().join("server.key.tmp").exists());
    }

    fn assert_no_leftovers(dir: &TempDir) {
        for name in ["server.crt.tmp", "server.key.tmp", "server.crt.bak"] {
            assert!(!dir.path().join(name).exists(), "{}", name);
        }
    }

    #[test]
    fn test_failed_key_rename_restores_previous_certificate() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        let previous = valid_pair("gateway.example.com").certificate;
        fs::write(files.cert_path(), &previous).unwrap();
        // Renaming a file over a directory fails
        fs::create_dir(files.key_path()).unwrap();
        fs::write(files.key_path().join("keep"), b"x").unwrap();

        let err = files.save(&valid_pair("gateway.example.com")).unwrap_err();

        assert!(matches!(err, CertError::Persistence { .. }));
        assert_eq!(fs::read_to_string(files.cert_path()).unwrap(), previous);
        assert_no_leftovers(&dir);
    }

    #[test]
    fn test_failed_key_rename_without_previous_certificate() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        fs::create_dir(files.key_path()).unwrap();
        fs::write(files.key_path().join("keep"), b"x").unwrap();

        assert!(files.save(&valid_pair("gateway.example.com")).is_err());
        assert!(!files.cert_path().exists());
        assert_no_leftovers(&dir);
    }

    #[test]
    fn test_garbage_certificate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        let pair = ChainKeyPair {
            chain: String::new(),
            certificate: "not a certificate".into(),
            private_key: "not a key".into(),
        };

        assert!(files.save(&pair).is_err());
        assert!(!files.exists());
    }

    #[test]
    fn test_chain_is_appended_after_leaf() {
        let pair = ChainKeyPair {
            chain: "CHAIN\n".into(),
            certificate: "LEAF\n\n".into(),
            private_key: String::new(),
        };
        assert_eq!(certificate_pem(&pair), "LEAF\nCHAIN\n");
    }

    #[test]
    fn test_load_validity_reads_window() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        let not_before = time::macros::datetime!(2024-01-01 00:00 UTC);
        let not_after = time::macros::datetime!(2024-01-15 00:00 UTC);
        files
            .save(&generate_pair("svc.example.com", not_before, not_after))
            .unwrap();

        let validity = files.load_validity().unwrap();
        assert_eq!(validity.not_before.timestamp(), not_before.unix_timestamp());
        assert_eq!(validity.not_after.timestamp(), not_after.unix_timestamp());
    }

    #[test]
    fn test_missing_files_are_persistence_errors() {
        let files = CertificateFiles::new("/nonexistent/server.crt", "/nonexistent/server.key");
        let err = files.load_validity().unwrap_err();
        assert!(matches!(err, CertError::Persistence { .. }));
    }
}
