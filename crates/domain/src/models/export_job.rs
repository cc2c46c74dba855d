//! Export job domain model and lifecycle rules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Retention window applied when a job does not specify one.
pub const DEFAULT_PACKAGE_RETENTION_DAYS: i32 = 7;

/// Export job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Cancelling,
    RolledBack,
}

impl ExportJobStatus {
    /// Statuses that hold the per-tool export slot.
    pub const ACTIVE: [ExportJobStatus; 3] = [
        ExportJobStatus::Pending,
        ExportJobStatus::InProgress,
        ExportJobStatus::Cancelling,
    ];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportJobStatus::Pending => "pending",
            ExportJobStatus::InProgress => "in_progress",
            ExportJobStatus::Completed => "completed",
            ExportJobStatus::Failed => "failed",
            ExportJobStatus::Cancelled => "cancelled",
            ExportJobStatus::Cancelling => "cancelling",
            ExportJobStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the job still occupies its tool's export slot.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Whether no further caller action can change the job.
    ///
    /// `Failed` counts as terminal even though the executor may still move it
    /// to `RolledBack` once compensation finishes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportJobStatus::Completed
                | ExportJobStatus::Failed
                | ExportJobStatus::Cancelled
                | ExportJobStatus::RolledBack
        )
    }

    /// Legal edges of the job state machine.
    pub fn can_transition_to(&self, next: ExportJobStatus) -> bool {
        use ExportJobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelling)
                | (Cancelling, Cancelled)
                | (Failed, RolledBack)
        )
    }
}

impl std::fmt::Display for ExportJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ExportJobStatus::Pending),
            "in_progress" => Ok(ExportJobStatus::InProgress),
            "completed" => Ok(ExportJobStatus::Completed),
            "failed" => Ok(ExportJobStatus::Failed),
            "cancelled" => Ok(ExportJobStatus::Cancelled),
            "cancelling" => Ok(ExportJobStatus::Cancelling),
            "rolled_back" => Ok(ExportJobStatus::RolledBack),
            _ => Err(format!("Unknown export job status: {}", s)),
        }
    }
}

/// Sub-reason recorded alongside a failed or rolled back job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Tool configuration was rejected before anything was written.
    ValidationFailed,
    /// A pipeline step failed; compensation succeeded or was not needed.
    StepFailed,
    /// A pipeline step failed and at least one compensation failed too.
    RollbackFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ValidationFailed => "validation_failed",
            FailureReason::StepFailed => "step_failed",
            FailureReason::RollbackFailed => "rollback_failed",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation_failed" => Ok(FailureReason::ValidationFailed),
            "step_failed" => Ok(FailureReason::StepFailed),
            "rollback_failed" => Ok(FailureReason::RollbackFailed),
            _ => Err(format!("Unknown failure reason: {}", s)),
        }
    }
}

/// Why a package cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The artifact was reclaimed or its retention window has passed.
    Expired,
    /// The job has not reached `COMPLETED` yet.
    NotReady,
    /// The job ended without producing an artifact.
    Failed,
}

impl UnavailableReason {
    /// Human readable message for the caller to render.
    pub fn message(&self) -> &'static str {
        match self {
            UnavailableReason::Expired => "The export package has expired",
            UnavailableReason::NotReady => "The export package is not ready yet",
            UnavailableReason::Failed => "The export did not produce a package",
        }
    }
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::Expired => write!(f, "expired"),
            UnavailableReason::NotReady => write!(f, "not_ready"),
            UnavailableReason::Failed => write!(f, "failed"),
        }
    }
}

/// Artifact fields committed together on the transition into `COMPLETED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPackage {
    pub path: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub algorithm: String,
    pub verified_at: DateTime<Utc>,
}

/// A tracked unit of work producing a downloadable package for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub job_id: Uuid,
    pub tool_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: ExportJobStatus,
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
    pub failure_reason: Option<FailureReason>,
    pub corrupted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// Build a fresh `PENDING` job. `current_step` points at the first step.
    pub fn new_pending(
        tool_id: Uuid,
        user_id: Option<Uuid>,
        steps_total: i32,
        first_step: Option<&str>,
        retention_days: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            tool_id,
            user_id,
            status: ExportJobStatus::Pending,
            steps_completed: 0,
            steps_total: steps_total.max(0),
            current_step: first_step.map(str::to_string),
            progress_percentage: 0,
            package_path: None,
            package_size_bytes: None,
            package_checksum: None,
            package_algorithm: None,
            checksum_verified_at: None,
            download_count: 0,
            last_downloaded_at: None,
            package_expires_at: None,
            package_retention_days: retention_days,
            error_message: None,
            failure_reason: None,
            corrupted_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Expiry derived from a completion time and this job's retention window.
    pub fn expiry_for(&self, completed_at: DateTime<Utc>) -> DateTime<Utc> {
        completed_at + Duration::days(self.package_retention_days as i64)
    }

    /// Whether the retention window has been reached at `now`.
    pub fn is_package_expired(&self, now: DateTime<Utc>) -> bool {
        self.package_expires_at.map_or(false, |expires| now >= expires)
    }

    /// Reason the package cannot be served at `now`, if any.
    ///
    /// Integrity is checked separately by the download path.
    pub fn unavailable_reason(&self, now: DateTime<Utc>) -> Option<UnavailableReason> {
        match self.status {
            ExportJobStatus::Pending
            | ExportJobStatus::InProgress
            | ExportJobStatus::Cancelling => {
                Some(UnavailableReason::NotReady)
            }
            ExportJobStatus::Failed | ExportJobStatus::RolledBack | ExportJobStatus::Cancelled => {
                Some(UnavailableReason::Failed)
            }
            ExportJobStatus::Completed => {
                if self.package_path.is_none() || self.is_package_expired(now) {
                    Some(UnavailableReason::Expired)
                } else {
                    None
                }
            }
        }
    }
}

/// `round(100 * completed / total)`, or 0 when there are no steps.
///
/// Integer arithmetic rounds halves up, matching `f64::round` for
/// non-negative inputs.
pub fn progress_percentage(steps_completed: i32, steps_total: i32) -> i32 {
    if steps_total <= 0 {
        return 0;
    }
    let completed = steps_completed.clamp(0, steps_total) as i64;
    let total = steps_total as i64;
    ((200 * completed + total) / (2 * total)) as i32
}
