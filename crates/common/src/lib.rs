//! Shared building blocks for the Lemur certificate gateway.
//!
//! - [`ids`]: typed identifiers for CA records, manifest digests and requests
//! - [`observability`]: tracing subscriber installation
//! - [`metrics`]: the certificate counters handed to components as a capability

pub mod ids;
pub mod metrics;
pub mod observability;

pub use ids::{CertificateId, ManifestDigest, RequestId};
pub use metrics::CertMetrics;
pub use observability::{init_tracing, LogFormat, LoggingConfig};
