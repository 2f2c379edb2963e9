//! Certificate lifecycle counters.
//!
//! [`CertMetrics`] owns its own [`Registry`] rather than registering into the
//! prometheus default registry, so every gateway instance (and every test)
//! gets an isolated set of counters. Clones share the same counters.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// Counters for certificate requests, issuance, failures and refreshes
#[derive(Clone, Debug)]
pub struct CertMetrics {
    registry: Registry,
    requests: IntCounter,
    issued: IntCounter,
    errors: IntCounter,
    refreshes: IntCounter,
}

impl CertMetrics {
    /// Create the counters and register them in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = counter(
            &registry,
            "lemur_certs_requests_total",
            "End-user certificate requests received",
        )?;
        let issued = counter(
            &registry,
            "lemur_certs_issued_total",
            "Certificates handed out to end users",
        )?;
        let errors = counter(
            &registry,
            "lemur_certs_errors_total",
            "Failed certificate requests and refreshes",
        )?;
        let refreshes = counter(
            &registry,
            "lemur_certs_refreshes_total",
            "Serving certificate swaps performed by the reloader",
        )?;

        Ok(Self {
            registry,
            requests,
            issued,
            errors,
            refreshes,
        })
    }

    pub fn record_request(&self) {
        self.requests.inc();
    }

    pub fn record_issued(&self) {
        self.issued.inc();
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    pub fn record_refresh(&self) {
        self.refreshes.inc();
    }

    pub fn requests(&self) -> u64 {
        self.requests.get()
    }

    pub fn issued(&self) -> u64 {
        self.issued.get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.get()
    }

    /// Render all counters in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
