//! In-memory export job store.
//!
//! Follows the same conditional-update rules as the Postgres store; a single
//! write lock plays the role of the row lock and the partial unique index.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::job_store::{ExportJobStore, RepositoryError, TransitionUpdate};
use crate::models::{
    progress_percentage, ExportJob, ExportJobStatus, JobListFilter, JobSortField, SortOrder,
};

/// Export job store backed by a map, for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryExportJobStore {
    jobs: RwLock<HashMap<Uuid, ExportJob>>,
}

impl InMemoryExportJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, ExportJob>>, RepositoryError> {
        self.jobs
            .read()
            .map_err(|_| RepositoryError::Backend("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, ExportJob>>, RepositoryError> {
        self.jobs
            .write()
            .map_err(|_| RepositoryError::Backend("job store lock poisoned".into()))
    }
}

fn sort_key_cmp(field: JobSortField, a: &ExportJob, b: &ExportJob) -> Ordering {
    // Missing values sort last regardless of direction; handled by caller.
    match field {
        JobSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        JobSortField::CompletedAt => a.completed_at.cmp(&b.completed_at),
        JobSortField::DownloadCount => a.download_count.cmp(&b.download_count),
        JobSortField::PackageSizeBytes => a.package_size_bytes.cmp(&b.package_size_bytes),
    }
}

fn is_null(field: JobSortField, job: &ExportJob) -> bool {
    match field {
        JobSortField::CompletedAt => job.completed_at.is_none(),
        JobSortField::PackageSizeBytes => job.package_size_bytes.is_none(),
        JobSortField::CreatedAt | JobSortField::DownloadCount => false,
    }
}

fn compare_jobs(filter: &JobListFilter, a: &ExportJob, b: &ExportJob) -> Ordering {
    let field = filter.sort_by;
    match (is_null(field, a), is_null(field, b)) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    let primary = sort_key_cmp(field, a, b);
    let primary = match filter.sort_order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };

    primary
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.job_id.cmp(&b.job_id))
}

#[async_trait::async_trait]
impl ExportJobStore for InMemoryExportJobStore {
    async fn insert_pending(&self, job: ExportJob) -> Result<ExportJob, RepositoryError> {
        let mut jobs = self.write()?;

        let busy = jobs
            .values()
            .any(|existing| existing.tool_id == job.tool_id && existing.status.is_active());
        if busy {
            return Err(RepositoryError::ActiveJobExists {
                tool_id: job.tool_id,
            });
        }

        jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<ExportJob>, RepositoryError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn find_active_for_tool(
        &self,
        tool_id: Uuid,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        Ok(self
            .read()?
            .values()
            .find(|job| job.tool_id == tool_id && job.status.is_active())
            .cloned())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: ExportJobStatus,
        to: ExportJobStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != from {
            return Ok(None);
        }

        job.status = to;
        job.updated_at = now;

        match to {
            ExportJobStatus::InProgress => job.started_at = Some(now),
            ExportJobStatus::Completed | ExportJobStatus::Failed | ExportJobStatus::Cancelled => {
                job.completed_at.get_or_insert(now);
            }
            _ => {}
        }

        if let Some(message) = update.error_message {
            job.error_message = Some(message);
        }
        if let Some(reason) = update.failure_reason {
            job.failure_reason = Some(reason);
        }
        if let (ExportJobStatus::Completed, Some(package)) = (to, update.package) {
            job.package_path = Some(package.path);
            job.package_size_bytes = Some(package.size_bytes);
            job.package_checksum = Some(package.checksum);
            job.package_algorithm = Some(package.algorithm);
            job.checksum_verified_at = Some(package.verified_at);
            job.package_expires_at =
                Some(now + Duration::days(job.package_retention_days as i64));
        }

        Ok(Some(job.clone()))
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        steps_completed: i32,
        current_step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let running = matches!(
            job.status,
            ExportJobStatus::InProgress | ExportJobStatus::Cancelling
        );
        if !running || steps_completed < job.steps_completed || steps_completed > job.steps_total {
            return Ok(None);
        }

        job.steps_completed = steps_completed;
        job.progress_percentage = progress_percentage(steps_completed, job.steps_total);
        job.current_step = current_step.map(str::to_string);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn record_download(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != ExportJobStatus::Completed || job.package_path.is_none() {
            return Ok(None);
        }

        job.download_count += 1;
        job.last_downloaded_at = Some(now);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn record_verification(
        &self,
        job_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.package_path.is_some() => {
                job.checksum_verified_at = Some(verified_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flag_corrupted(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.corrupted_at.get_or_insert(now);
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_expired_packages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        let jobs = self.read()?;
        let mut expired: Vec<ExportJob> = jobs
            .values()
            .filter(|job| {
                job.status == ExportJobStatus::Completed
                    && job.package_path.is_some()
                    && job.is_package_expired(now)
            })
            .cloned()
            .collect();

        expired.sort_by_key(|job| job.package_expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn find_stale_verifications(
        &self,
        verified_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        let jobs = self.read()?;
        let mut stale: Vec<ExportJob> = jobs
            .values()
            .filter(|job| {
                job.status == ExportJobStatus::Completed
                    && job.package_path.is_some()
                    && job.corrupted_at.is_none()
                    && !job.is_package_expired(now)
                    && job
                        .checksum_verified_at
                        .map_or(true, |verified| verified < verified_before)
            })
            .cloned()
            .collect();

        stale.sort_by_key(|job| job.checksum_verified_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn clear_package(
        &self,
        job_id: Uuid,
        package_path: &str,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.package_path.as_deref() == Some(package_path) => {
                job.package_path = None;
                job.package_size_bytes = None;
                job.package_checksum = None;
                job.package_algorithm = None;
                job.checksum_verified_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<ExportJob>, RepositoryError> {
        let jobs = self.read()?;
        let mut pending: Vec<ExportJob> = jobs
            .values()
            .filter(|job| job.status == ExportJobStatus::Pending)
            .cloned()
            .collect();

        pending.sort_by_key(|job| job.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn list(
        &self,
        filter: &JobListFilter,
    ) -> Result<(Vec<ExportJob>, i64), RepositoryError> {
        let jobs = self.read()?;
        let mut matching: Vec<ExportJob> =
            jobs.values().filter(|job| filter.matches(job)).cloned().collect();
        let total = matching.len() as i64;

        matching.sort_by(|a, b| compare_jobs(filter, a, b));
        let page = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.write()?.remove(&job_id).is_some())
    }
}
