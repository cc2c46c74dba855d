//! Reclaims expired packages and re-verifies live ones.

use chrono::{DateTime, Duration, Utc};
use domain::services::ExportJobStore;
use metrics::counter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::checksum::{self, Verification};
use super::package_builder::PackageBuilder;
use crate::error::ExportError;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    /// Expired but downloaded within the grace window.
    pub skipped_recent: usize,
    pub verified: usize,
    pub corrupted: usize,
}

#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn ExportJobStore>,
    packages: Arc<PackageBuilder>,
    grace_window: Duration,
    verification_freshness: Duration,
    batch_size: i64,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn ExportJobStore>,
        packages: Arc<PackageBuilder>,
        grace_window: Duration,
        verification_freshness: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            packages,
            grace_window,
            verification_freshness,
            batch_size,
        }
    }

    /// One sweep as of `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ExportError> {
        let mut report = SweepReport::default();
        self.reclaim_expired(now, &mut report).await?;
        self.verify_live(now, &mut report).await?;

        if report != SweepReport::default() {
            info!(
                reclaimed = report.reclaimed,
                skipped_recent = report.skipped_recent,
                verified = report.verified,
                corrupted = report.corrupted,
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ExportError> {
        let expired = self.store.find_expired_packages(now, self.batch_size).await?;

        for job in expired {
            let recently_downloaded = job
                .last_downloaded_at
                .map_or(false, |at| now - at < self.grace_window);
            if recently_downloaded {
                debug!(job_id = %job.job_id, "Keeping recently downloaded package");
                report.skipped_recent += 1;
                continue;
            }

            let Some(path) = job.package_path.as_deref() else {
                continue;
            };

            if let Err(e) = self.packages.remove_file(Path::new(path)).await {
                warn!(job_id = %job.job_id, error = %e, "Failed to delete expired package");
                continue;
            }
            if let Err(e) = self
                .packages
                .remove_dir_if_empty(&self.packages.job_dir(job.job_id))
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "Failed to remove package directory");
            }

            if self.store.clear_package(job.job_id, path).await? {
                counter!("export_packages_reclaimed_total").increment(1);
                report.reclaimed += 1;
            }
        }

        Ok(())
    }

    async fn verify_live(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ExportError> {
        let stale = self
            .store
            .find_stale_verifications(now - self.verification_freshness, now, self.batch_size)
            .await?;

        for job in stale {
            let (Some(path), Some(expected)) =
                (job.package_path.as_deref(), job.package_checksum.as_deref())
            else {
                continue;
            };

            match checksum::verify(Path::new(path), expected).await? {
                Verification::Intact => {
                    self.store.record_verification(job.job_id, now).await?;
                    report.verified += 1;
                }
                outcome => {
                    warn!(
                        job_id = %job.job_id,
                        outcome = ?outcome,
                        "Stored package failed verification"
                    );
                    self.store.flag_corrupted(job.job_id, now).await?;
                    report.corrupted += 1;
                }
            }
        }

        Ok(())
    }
}
