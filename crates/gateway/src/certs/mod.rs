//! Certificate lifecycle for the gateway's own TLS identity and for
//! certificates issued to end users.
//!
//! # Architecture
//!
//! - [`Manifest`] - content-addressed description of a wanted certificate
//! - [`CaClient`] - get-or-create against the Lemur CA API
//! - [`CertificateFiles`] - owner-only PEM files, validated before use
//! - [`KeypairReloader`] - holds the live serving certificate and hands it
//!   to every TLS handshake
//! - [`RefreshScheduler`] - background task that refreshes the serving
//!   certificate before it expires
//!
//! # Refresh flow
//!
//! 1. [`RefreshScheduler`] wakes and reads the validity of the file on disk
//! 2. If it is not valid yet, or expires within the look-ahead window,
//!    [`KeypairReloader`] builds a server [`Manifest`]
//! 3. [`CaClient`] searches the CA by the manifest description and creates
//!    the certificate when nothing matched, then fetches the key
//! 4. [`CertificateFiles`] writes, validates and renames the new files
//! 5. [`KeypairReloader`] swaps the new certificate in for new handshakes

mod client;
mod error;
mod manifest;
pub(crate) mod reloader;
mod scheduler;
pub(crate) mod storage;

pub use client::{
    CaClient, CertificatePage, CertificateRecord, CertificateSource, ChainKeyPair,
    CredentialSource,
};
pub use error::{CertError, ErrorKind};
pub use manifest::{
    CertificateUsage, Extensions, Manifest, ManifestBuilder, CLIENT_CERT_LABEL, DIGEST_SEPARATOR,
    SERVER_CERT_LABEL,
};
pub use reloader::{validity_window, ActiveCertificate, KeypairReloader};
pub use scheduler::{RefreshOutcome, RefreshScheduler};
pub use storage::{CertificateFiles, LoadedCertificate, Validity};
