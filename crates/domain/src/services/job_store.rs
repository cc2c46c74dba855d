//! Export job persistence abstraction.
//!
//! Every mutating operation is a single conditional update keyed on the row's
//! current state, so two workers holding the same job id cannot both win.
//! Implementations must also guarantee that at most one job per tool is in an
//! active status at any time; callers never check that in memory.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CompletedPackage, ExportJob, ExportJobStatus, FailureReason, JobListFilter};

/// Errors surfaced by job and tool storage.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("An active export job already exists for tool {tool_id}")]
    ActiveJobExists { tool_id: Uuid },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Extra fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionUpdate {
    /// Replaces the stored message when set.
    pub error_message: Option<String>,
    pub failure_reason: Option<FailureReason>,
    /// Artifact fields; only honored on the transition into `COMPLETED`.
    pub package: Option<CompletedPackage>,
}

impl TransitionUpdate {
    pub fn failed(message: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            error_message: Some(message.into()),
            failure_reason: Some(reason),
            package: None,
        }
    }

    pub fn completed(package: CompletedPackage) -> Self {
        Self {
            package: Some(package),
            ..Default::default()
        }
    }
}

/// Storage for export jobs.
///
/// Status transition rules applied by every implementation of [`transition`]:
/// - `updated_at` becomes `now`
/// - entering `IN_PROGRESS` sets `started_at`
/// - entering `COMPLETED`, `FAILED` or `CANCELLED` sets `completed_at` if unset
/// - entering `COMPLETED` with a package writes all artifact fields and
///   `package_expires_at = now + package_retention_days`
///
/// [`transition`]: ExportJobStore::transition
#[async_trait::async_trait]
pub trait ExportJobStore: Send + Sync {
    /// Insert a new `PENDING` job. Fails with `ActiveJobExists` when the tool
    /// already has a `PENDING`/`IN_PROGRESS`/`CANCELLING` job.
    async fn insert_pending(&self, job: ExportJob) -> Result<ExportJob, RepositoryError>;

    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<ExportJob>, RepositoryError>;

    async fn find_active_for_tool(&self, tool_id: Uuid)
        -> Result<Option<ExportJob>, RepositoryError>;

    /// Move `job_id` from `from` to `to`. Returns `None` without touching the
    /// row when it is not currently in `from`.
    async fn transition(
        &self,
        job_id: Uuid,
        from: ExportJobStatus,
        to: ExportJobStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError>;

    /// Persist step progress and recompute `progress_percentage` in the same
    /// write. Only applies while the job is `IN_PROGRESS` or `CANCELLING` and
    /// when `steps_completed` neither decreases nor exceeds `steps_total`.
    async fn record_progress(
        &self,
        job_id: Uuid,
        steps_completed: i32,
        current_step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError>;

    /// Increment `download_count` and stamp `last_downloaded_at` on a
    /// completed job that still has a package.
    async fn record_download(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError>;

    async fn record_verification(
        &self,
        job_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Mark the artifact as failing integrity checks. Keeps the first stamp.
    async fn flag_corrupted(&self, job_id: Uuid, now: DateTime<Utc>)
        -> Result<bool, RepositoryError>;

    /// Completed jobs whose package is still referenced but whose expiry is
    /// at or before `now`, oldest expiry first.
    async fn find_expired_packages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError>;

    /// Live, unflagged packages last verified before `verified_before`.
    async fn find_stale_verifications(
        &self,
        verified_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError>;

    /// Clear artifact pointers if the row still references `package_path`.
    /// Status and timestamps are left as they are.
    async fn clear_package(&self, job_id: Uuid, package_path: &str)
        -> Result<bool, RepositoryError>;

    /// Oldest `PENDING` jobs first.
    async fn find_pending(&self, limit: i64) -> Result<Vec<ExportJob>, RepositoryError>;

    /// Filtered, sorted page plus the total number of matching rows.
    async fn list(&self, filter: &JobListFilter) -> Result<(Vec<ExportJob>, i64), RepositoryError>;

    /// Hard delete; reserved for administrative purge.
    async fn delete(&self, job_id: Uuid) -> Result<bool, RepositoryError>;
}
