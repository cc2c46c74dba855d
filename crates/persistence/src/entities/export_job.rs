//! Export job entity.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Column list shared by every query returning [`ExportJobEntity`].
pub const EXPORT_JOB_COLUMNS: &str = "job_id, tool_id, user_id, status, steps_completed, \
    steps_total, current_step, progress_percentage, package_path, package_size_bytes, \
    package_checksum, package_algorithm, checksum_verified_at, download_count, \
    last_downloaded_at, package_expires_at, package_retention_days, error_message, \
    failure_reason, corrupted_at, created_at, updated_at, started_at, completed_at";

/// Database row for `export_jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct ExportJobEntity {
    pub job_id: Uuid,
    pub tool_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: String,
    pub steps_completed: i32,
    pub steps_total: i32,
    pub current_step: Option<String>,
    pub progress_percentage: i32,
    pub package_path: Option<String>,
    pub package_size_bytes: Option<i64>,
    pub package_checksum: Option<String>,
    pub package_algorithm: Option<String>,
    pub checksum_verified_at: Option<DateTime<Utc>>,
    pub download_count: i64,
    pub last_downloaded_at: Option<DateTime<Utc>>,
    pub package_expires_at: Option<DateTime<Utc>>,
    pub package_retention_days: i32,
    pub error_message: Option<String>,
    /// One of `validation_failed`, `step_failed`, `rollback_failed`.
    pub failure_reason: Option<String>,
    pub corrupted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
