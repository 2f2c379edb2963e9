//! Lemur certificate gateway
//!
//! The gateway serves HTTPS with a certificate it obtains from a Lemur CA
//! and keeps fresh without restarting. It also hands short-lived client
//! certificates to authenticated users.
//!
//! - [`auth`] - who may request a certificate, and for which RBAC group
//! - [`certs`] - manifests, the CA client, on-disk storage and hot reload
//! - [`request`] - end-user certificate requests
//! - [`server`] - TLS listeners and HTTP handlers

pub mod auth;
pub mod certs;
pub mod request;
pub mod server;

pub use auth::{Authenticator, Principal};
pub use certs::{CaClient, CertError, KeypairReloader, Manifest, RefreshScheduler};
pub use request::{CertRequest, CertRequestService, IssueError};
