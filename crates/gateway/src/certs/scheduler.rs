//! Background certificate refresh scheduler
//!
//! Periodically checks the serving certificate on disk and asks the
//! [`KeypairReloader`] for a new one when it is not valid yet or about to
//! expire. Failures are logged and retried on the next tick; the loop only
//! ends when its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reloader::KeypairReloader;

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// What a single check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The certificate on disk is fine
    Fresh,
    /// A new certificate was swapped in
    Refreshed,
    /// A refresh was needed but failed; the old certificate keeps serving
    Failed,
}

/// Background refresh scheduler
pub struct RefreshScheduler {
    reloader: Arc<KeypairReloader>,
    check_interval: Duration,
}

impl RefreshScheduler {
    /// The interval is clamped to a minimum of one minute.
    pub fn new(reloader: Arc<KeypairReloader>, check_interval: Duration) -> Self {
        Self {
            reloader,
            check_interval: check_interval.max(MIN_CHECK_INTERVAL),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The reloader already loaded a certificate at startup, so the first
    /// check happens one interval from now.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            lookahead_secs = self.reloader.lookahead().as_secs(),
            "Starting certificate refresh scheduler"
        );

        let mut ticks = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Certificate refresh scheduler stopped");
                    return;
                }
                _ = ticks.tick() => {
                    debug!("Running scheduled certificate check");
                    self.check_once(Utc::now()).await;
                }
            }
        }
    }

    /// Check the certificate on disk once and refresh it if needed
    pub async fn check_once(&self, now: DateTime<Utc>) -> RefreshOutcome {
        match self.reloader.needs_refresh(now) {
            Ok(false) => {
                debug!("Server certificate is still valid");
                return RefreshOutcome::Fresh;
            }
            Ok(true) => {
                info!("Server certificate is or will soon be out-of-date, refreshing");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Unable to read server certificate from disk, refreshing"
                );
            }
        }

        match self.reloader.reload(now).await {
            Ok(_) => RefreshOutcome::Refreshed,
            Err(e) => {
                error!(
                    error = %e,
                    "Keeping old TLS certificate because the new one could not be loaded"
                );
                RefreshOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::error::CertError;
    use crate::certs::reloader::tests::{test_config, FakeSource};
    use crate::certs::storage::tests::{generate_pair, valid_pair};
    use crate::certs::storage::Validity;
    use lemur_common::CertMetrics;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    async fn setup(
        first: crate::certs::ChainKeyPair,
    ) -> (TempDir, Arc<FakeSource>, Arc<KeypairReloader>) {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        source.push_ok(first);
        let reloader = KeypairReloader::new(
            &test_config(&dir),
            source.clone(),
            CertMetrics::new().unwrap(),
        )
        .await
        .unwrap();
        (dir, source, Arc::new(reloader))
    }

    #[test]
    fn test_refresh_boundary_is_inclusive() {
        let now = Utc::now();
        let lookahead = Duration::from_secs(24 * 3600);
        let at_threshold = Validity {
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::hours(24),
        };
        let past_threshold = Validity {
            not_after: at_threshold.not_after + chrono::Duration::seconds(1),
            ..at_threshold
        };

        assert!(at_threshold.needs_refresh(now, lookahead));
        assert!(!past_threshold.needs_refresh(now, lookahead));
    }

    #[test]
    fn test_not_yet_valid_needs_refresh() {
        let now = Utc::now();
        let validity = Validity {
            not_before: now + chrono::Duration::seconds(1),
            not_after: now + chrono::Duration::days(365),
        };
        assert!(validity.needs_refresh(now, Duration::from_secs(24 * 3600)));
    }

    proptest! {
        #[test]
        fn prop_refresh_iff_inside_lookahead(offset_secs in -86_400i64 * 30..86_400 * 30) {
            let now = Utc::now();
            let lookahead = Duration::from_secs(24 * 3600);
            let validity = Validity {
                not_before: now - chrono::Duration::days(400),
                not_after: now + chrono::Duration::seconds(24 * 3600 + offset_secs),
            };
            prop_assert_eq!(validity.needs_refresh(now, lookahead), offset_secs <= 0);
        }
    }

    #[tokio::test]
    async fn test_interval_is_clamped() {
        let (_dir, _source, reloader) = setup(valid_pair("gateway.example.com")).await;

        let scheduler = RefreshScheduler::new(reloader, Duration::from_secs(1));
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[tokio::test]
    async fn test_check_once_leaves_fresh_certificate() {
        let (_dir, source, reloader) = setup(valid_pair("gateway.example.com")).await;
        let scheduler = RefreshScheduler::new(reloader, Duration::from_secs(3600));

        assert_eq!(scheduler.check_once(Utc::now()).await, RefreshOutcome::Fresh);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_once_refreshes_expiring_certificate() {
        let now = time::OffsetDateTime::now_utc();
        let expiring = generate_pair(
            "gateway.example.com",
            now - time::Duration::days(30),
            now + time::Duration::hours(1),
        );
        let (_dir, source, reloader) = setup(expiring).await;
        source.push_ok(valid_pair("gateway.example.com"));
        let scheduler = RefreshScheduler::new(Arc::clone(&reloader), Duration::from_secs(3600));

        assert_eq!(
            scheduler.check_once(Utc::now()).await,
            RefreshOutcome::Refreshed
        );
        assert!(!reloader.needs_refresh(Utc::now()).unwrap());
    }

    #[tokio::test]
    async fn test_check_once_survives_ca_outage() {
        let now = time::OffsetDateTime::now_utc();
        let expiring = generate_pair(
            "gateway.example.com",
            now - time::Duration::days(30),
            now + time::Duration::hours(1),
        );
        let (_dir, source, reloader) = setup(expiring).await;
        let before = reloader.current();
        source.push_err(CertError::Configuration("credentials gone".into()));
        let scheduler = RefreshScheduler::new(Arc::clone(&reloader), Duration::from_secs(3600));

        assert_eq!(scheduler.check_once(Utc::now()).await, RefreshOutcome::Failed);
        assert!(Arc::ptr_eq(&before, &reloader.current()));
    }

    #[tokio::test]
    async fn test_missing_file_triggers_refresh() {
        let (_dir, source, reloader) = setup(valid_pair("gateway.example.com")).await;
        std::fs::remove_file(reloader.files().cert_path()).unwrap();
        source.push_ok(valid_pair("gateway.example.com"));
        let scheduler = RefreshScheduler::new(Arc::clone(&reloader), Duration::from_secs(3600));

        assert_eq!(
            scheduler.check_once(Utc::now()).await,
            RefreshOutcome::Refreshed
        );
        assert!(reloader.files().exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_dir, _source, reloader) = setup(valid_pair("gateway.example.com")).await;
        let scheduler = RefreshScheduler::new(reloader, Duration::from_secs(3600));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
