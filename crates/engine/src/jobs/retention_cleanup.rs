//! Periodic reclaim of expired export packages.

use tracing::info;

use super::scheduler::{Job, JobFrequency};
use crate::error::ExportError;
use crate::services::ExportService;

/// Runs the retention sweep on a fixed interval.
pub struct RetentionCleanupJob {
    service: ExportService,
    interval_minutes: u64,
}

impl RetentionCleanupJob {
    pub fn new(service: ExportService, interval_minutes: u64) -> Self {
        Self {
            service,
            interval_minutes,
        }
    }
}

#[async_trait::async_trait]
impl Job for RetentionCleanupJob {
    fn name(&self) -> &'static str {
        "retention_cleanup"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_minutes)
    }

    async fn execute(&self) -> Result<(), ExportError> {
        let report = self.service.run_retention().await?;
        if report.reclaimed > 0 || report.corrupted > 0 {
            info!(
                reclaimed = report.reclaimed,
                corrupted = report.corrupted,
                "Retention cleanup reclaimed storage"
            );
        }
        Ok(())
    }
}
