//! Download gating and accounting.

use chrono::{DateTime, Utc};
use domain::models::{ExportJob, UnavailableReason};
use domain::services::ExportJobStore;
use metrics::counter;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use super::checksum::{self, Verification};
use crate::error::ExportError;

/// A package ready to be streamed to the caller.
pub struct PackageDownload {
    /// Job row after the download was counted.
    pub job: ExportJob,
    pub file_name: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub stream: ReaderStream<File>,
}

impl std::fmt::Debug for PackageDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageDownload")
            .field("job_id", &self.job.job_id)
            .field("file_name", &self.file_name)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// Decides whether a package may be served and counts each delivery.
#[derive(Clone)]
pub struct DownloadAccountant {
    store: Arc<dyn ExportJobStore>,
}

impl DownloadAccountant {
    pub fn new(store: Arc<dyn ExportJobStore>) -> Self {
        Self { store }
    }

    /// Open the package of `job_id` for delivery at `now`.
    ///
    /// The archive is re-hashed on every request, so a package altered
    /// since the last check is never streamed. Nothing is counted unless
    /// the package is servable and intact.
    pub async fn download(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PackageDownload, ExportError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(ExportError::NotFound(job_id))?;

        if let Some(reason) = job.unavailable_reason(now) {
            return Err(ExportError::PackageUnavailable { reason });
        }
        if job.corrupted_at.is_some() {
            return Err(ExportError::CorruptedArtifact {
                job_id,
                detail: "package failed an earlier integrity check".to_string(),
            });
        }

        let (Some(path), Some(expected)) =
            (job.package_path.as_deref(), job.package_checksum.as_deref())
        else {
            return Err(ExportError::PackageUnavailable {
                reason: UnavailableReason::Expired,
            });
        };
        let path = Path::new(path);

        let verification = checksum::verify(path, expected).await?;
        if let Some(err) = checksum::corruption_error(job_id, &verification) {
            return Err(self.reject_corrupted(job_id, err, now).await);
        }
        self.store.record_verification(job_id, now).await?;

        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let err = checksum::corruption_error(job_id, &Verification::Missing)
                    .unwrap_or(ExportError::NotFound(job_id));
                return Err(self.reject_corrupted(job_id, err, now).await);
            }
            Err(e) => return Err(e.into()),
        };
        let size_bytes = file.metadata().await?.len();

        let Some(counted) = self.store.record_download(job_id, now).await? else {
            // Reclaimed between the checks above and the increment.
            return Err(ExportError::PackageUnavailable {
                reason: UnavailableReason::Expired,
            });
        };

        counter!("export_downloads_total").increment(1);
        info!(
            job_id = %job_id,
            download_count = counted.download_count,
            size_bytes = size_bytes,
            "Export package downloaded"
        );

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.tar.gz", job_id));

        Ok(PackageDownload {
            checksum: expected.to_string(),
            job: counted,
            file_name,
            size_bytes,
            stream: ReaderStream::new(file),
        })
    }

    async fn reject_corrupted(
        &self,
        job_id: Uuid,
        err: ExportError,
        now: DateTime<Utc>,
    ) -> ExportError {
        warn!(job_id = %job_id, error = %err, "Refusing to serve corrupted package");
        if let Err(flag_err) = self.store.flag_corrupted(job_id, now).await {
            warn!(job_id = %job_id, error = %flag_err, "Failed to flag corrupted package");
        }
        err
    }
}
