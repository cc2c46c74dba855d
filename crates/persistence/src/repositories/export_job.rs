//! Postgres-backed export job store.
//!
//! Every write is a single statement guarded by the row's current status, so
//! concurrent workers race on the database rather than in memory.

use chrono::{DateTime, Utc};
use domain::models::{
    CompletedPackage, ExportJob, ExportJobStatus, FailureReason, JobListFilter,
};
use domain::services::{ExportJobStore, RepositoryError, TransitionUpdate};
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::export_job::EXPORT_JOB_COLUMNS;
use crate::entities::ExportJobEntity;
use crate::metrics::QueryTimer;

/// Partial unique index holding the per-tool export slot.
const ACTIVE_TOOL_INDEX: &str = "uq_export_jobs_active_tool";

/// Whether a database error is the per-tool slot already being taken.
fn is_active_tool_conflict(code: Option<&str>, constraint: Option<&str>) -> bool {
    code == Some("23505") && constraint == Some(ACTIVE_TOOL_INDEX)
}

/// Values bound into the conditional status update besides the statuses.
#[derive(Debug, PartialEq)]
struct TransitionParams {
    /// Sets `started_at`.
    starts: bool,
    /// Sets `completed_at` once.
    finishes: bool,
    error_message: Option<String>,
    failure_reason: Option<&'static str>,
    /// Artifact fields, only ever written together with `COMPLETED`.
    package: Option<CompletedPackage>,
}

impl TransitionParams {
    fn new(to: ExportJobStatus, update: TransitionUpdate) -> Self {
        Self {
            starts: to == ExportJobStatus::InProgress,
            finishes: matches!(
                to,
                ExportJobStatus::Completed | ExportJobStatus::Failed | ExportJobStatus::Cancelled
            ),
            error_message: update.error_message,
            failure_reason: update.failure_reason.map(|r| r.as_str()),
            package: update.package.filter(|_| to == ExportJobStatus::Completed),
        }
    }
}

/// Helper struct for building dynamic WHERE clauses from a list filter.
struct JobFilterBuilder {
    conditions: Vec<String>,
    param_count: i32,
}

impl JobFilterBuilder {
    fn build(filter: &JobListFilter) -> Self {
        let mut conditions = vec!["TRUE".to_string()];
        let mut param_count = 0;

        if !filter.statuses.is_empty() {
            param_count += 1;
            conditions.push(format!("status = ANY(${})", param_count));
        }

        if filter.tool_ids.is_some() {
            param_count += 1;
            conditions.push(format!("tool_id = ANY(${})", param_count));
        }

        if filter.user_id.is_some() {
            param_count += 1;
            conditions.push(format!("user_id = ${}", param_count));
        }

        if filter.created_from.is_some() {
            param_count += 1;
            conditions.push(format!("created_at >= ${}", param_count));
        }

        if filter.created_to.is_some() {
            param_count += 1;
            conditions.push(format!("created_at <= ${}", param_count));
        }

        Self {
            conditions,
            param_count,
        }
    }

    fn where_clause(&self) -> String {
        self.conditions.join(" AND ")
    }

    fn param_count(&self) -> i32 {
        self.param_count
    }
}

/// Bind filter parameters in the order [`JobFilterBuilder`] numbered them.
macro_rules! bind_job_filters {
    ($builder:expr, $filter:expr, $statuses:expr) => {{
        let mut b = $builder;
        if !$filter.statuses.is_empty() {
            b = b.bind($statuses);
        }
        if let Some(ref tool_ids) = $filter.tool_ids {
            b = b.bind(tool_ids.clone());
        }
        if let Some(user_id) = $filter.user_id {
            b = b.bind(user_id);
        }
        if let Some(from) = $filter.created_from {
            b = b.bind(from);
        }
        if let Some(to) = $filter.created_to {
            b = b.bind(to);
        }
        b
    }};
}

/// [`ExportJobStore`] on the `export_jobs` table.
#[derive(Clone)]
pub struct PgExportJobStore {
    pool: PgPool,
}

impl PgExportJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExportJobStore for PgExportJobStore {
    async fn insert_pending(&self, job: ExportJob) -> Result<ExportJob, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO export_jobs (
                job_id, tool_id, user_id, status, steps_completed, steps_total, current_step,
                progress_percentage, package_retention_days, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {}
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.insert_pending");
        let result = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(job.job_id)
            .bind(job.tool_id)
            .bind(job.user_id)
            .bind(job.status.as_str())
            .bind(job.steps_completed)
            .bind(job.steps_total)
            .bind(&job.current_step)
            .bind(job.progress_percentage)
            .bind(job.package_retention_days)
            .bind(job.created_at)
            .fetch_one(&self.pool)
            .await;
        timer.record();

        match result {
            Ok(entity) => entity_to_domain(entity),
            Err(sqlx::Error::Database(db_err))
                if is_active_tool_conflict(db_err.code().as_deref(), db_err.constraint()) =>
            {
                Err(RepositoryError::ActiveJobExists {
                    tool_id: job.tool_id,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<ExportJob>, RepositoryError> {
        let sql = format!("SELECT {} FROM export_jobs WHERE job_id = $1", EXPORT_JOB_COLUMNS);

        let timer = QueryTimer::new("export_jobs.find_by_id");
        let entity = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();

        entity.map_err(backend)?.map(entity_to_domain).transpose()
    }

    async fn find_active_for_tool(
        &self,
        tool_id: Uuid,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM export_jobs
            WHERE tool_id = $1 AND status IN ('pending', 'in_progress', 'cancelling')
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.find_active_for_tool");
        let entity = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(tool_id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();

        entity.map_err(backend)?.map(entity_to_domain).transpose()
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: ExportJobStatus,
        to: ExportJobStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let params = TransitionParams::new(to, update);
        let package = params.package;

        let sql = format!(
            r#"
            UPDATE export_jobs
            SET status = $3,
                updated_at = $4,
                started_at = CASE WHEN $5 THEN $4 ELSE started_at END,
                completed_at = CASE WHEN $6 THEN COALESCE(completed_at, $4) ELSE completed_at END,
                error_message = COALESCE($7, error_message),
                failure_reason = COALESCE($8, failure_reason),
                package_path = COALESCE($9, package_path),
                package_size_bytes = COALESCE($10, package_size_bytes),
                package_checksum = COALESCE($11, package_checksum),
                package_algorithm = COALESCE($12, package_algorithm),
                checksum_verified_at = COALESCE($13, checksum_verified_at),
                package_expires_at = CASE
                    WHEN $9::text IS NULL THEN package_expires_at
                    ELSE $4 + make_interval(days => package_retention_days)
                END
            WHERE job_id = $1 AND status = $2
            RETURNING {}
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.transition");
        let entity = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(job_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .bind(params.starts)
            .bind(params.finishes)
            .bind(params.error_message)
            .bind(params.failure_reason)
            .bind(package.as_ref().map(|p| p.path.clone()))
            .bind(package.as_ref().map(|p| p.size_bytes))
            .bind(package.as_ref().map(|p| p.checksum.clone()))
            .bind(package.as_ref().map(|p| p.algorithm.clone()))
            .bind(package.as_ref().map(|p| p.verified_at))
            .fetch_optional(&self.pool)
            .await;
        timer.record();

        entity.map_err(backend)?.map(entity_to_domain).transpose()
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        steps_completed: i32,
        current_step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE export_jobs
            SET steps_completed = $2,
                current_step = $3,
                progress_percentage = CASE
                    WHEN steps_total > 0 THEN (200 * $2 + steps_total) / (2 * steps_total)
                    ELSE 0
                END,
                updated_at = $4
            WHERE job_id = $1
              AND status IN ('in_progress', 'cancelling')
              AND steps_completed <= $2
              AND $2 <= steps_total
            RETURNING {}
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.record_progress");
        let entity = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(job_id)
            .bind(steps_completed)
            .bind(current_step)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;
        timer.record();

        entity.map_err(backend)?.map(entity_to_domain).transpose()
    }

    async fn record_download(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE export_jobs
            SET download_count = download_count + 1,
                last_downloaded_at = $2,
                updated_at = $2
            WHERE job_id = $1 AND status = 'completed' AND package_path IS NOT NULL
            RETURNING {}
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.record_download");
        let entity = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(job_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;
        timer.record();

        entity.map_err(backend)?.map(entity_to_domain).transpose()
    }

    async fn record_verification(
        &self,
        job_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let timer = QueryTimer::new("export_jobs.record_verification");
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET checksum_verified_at = $2
            WHERE job_id = $1 AND package_path IS NOT NULL
            "#,
        )
        .bind(job_id)
        .bind(verified_at)
        .execute(&self.pool)
        .await;
        timer.record();

        Ok(result.map_err(backend)?.rows_affected() > 0)
    }

    async fn flag_corrupted(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let timer = QueryTimer::new("export_jobs.flag_corrupted");
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET corrupted_at = COALESCE(corrupted_at, $2), updated_at = $2
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await;
        timer.record();

        Ok(result.map_err(backend)?.rows_affected() > 0)
    }

    async fn find_expired_packages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM export_jobs
            WHERE status = 'completed'
              AND package_path IS NOT NULL
              AND package_expires_at <= $1
            ORDER BY package_expires_at ASC
            LIMIT $2
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.find_expired_packages");
        let entities = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();

        entities_to_domain(entities.map_err(backend)?)
    }

    async fn find_stale_verifications(
        &self,
        verified_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM export_jobs
            WHERE status = 'completed'
              AND package_path IS NOT NULL
              AND corrupted_at IS NULL
              AND (package_expires_at IS NULL OR package_expires_at > $2)
              AND (checksum_verified_at IS NULL OR checksum_verified_at < $1)
            ORDER BY checksum_verified_at ASC NULLS FIRST
            LIMIT $3
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.find_stale_verifications");
        let entities = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(verified_before)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();

        entities_to_domain(entities.map_err(backend)?)
    }

    async fn clear_package(
        &self,
        job_id: Uuid,
        package_path: &str,
    ) -> Result<bool, RepositoryError> {
        let timer = QueryTimer::new("export_jobs.clear_package");
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET package_path = NULL,
                package_size_bytes = NULL,
                package_checksum = NULL,
                package_algorithm = NULL,
                checksum_verified_at = NULL
            WHERE job_id = $1 AND package_path = $2
            "#,
        )
        .bind(job_id)
        .bind(package_path)
        .execute(&self.pool)
        .await;
        timer.record();

        Ok(result.map_err(backend)?.rows_affected() > 0)
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<ExportJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM export_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
            EXPORT_JOB_COLUMNS
        );

        let timer = QueryTimer::new("export_jobs.find_pending");
        let entities = sqlx::query_as::<_, ExportJobEntity>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();

        entities_to_domain(entities.map_err(backend)?)
    }

    async fn list(
        &self,
        filter: &JobListFilter,
    ) -> Result<(Vec<ExportJob>, i64), RepositoryError> {
        let builder = JobFilterBuilder::build(filter);
        let where_clause = builder.where_clause();
        let param_count = builder.param_count();
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let count_query = format!("SELECT COUNT(*) FROM export_jobs WHERE {}", where_clause);
        let timer = QueryTimer::new("export_jobs.count");
        let count_builder = sqlx::query_scalar::<_, i64>(&count_query);
        let count_builder = bind_job_filters!(count_builder, filter, statuses.clone());
        let total = count_builder.fetch_one(&self.pool).await;
        timer.record();
        let total = total.map_err(backend)?;

        let list_query = format!(
            r#"
            SELECT {}
            FROM export_jobs
            WHERE {}
            ORDER BY {} {} NULLS LAST, created_at DESC, job_id ASC
            LIMIT ${} OFFSET ${}
            "#,
            EXPORT_JOB_COLUMNS,
            where_clause,
            filter.sort_by.column(),
            filter.sort_order.as_sql(),
            param_count + 1,
            param_count + 2
        );

        let timer = QueryTimer::new("export_jobs.list");
        let list_builder = sqlx::query_as::<_, ExportJobEntity>(&list_query);
        let list_builder = bind_job_filters!(list_builder, filter, statuses);
        let entities = list_builder
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await;
        timer.record();

        Ok((entities_to_domain(entities.map_err(backend)?)?, total))
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, RepositoryError> {
        let timer = QueryTimer::new("export_jobs.delete");
        let result = sqlx::query("DELETE FROM export_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await;
        timer.record();

        Ok(result.map_err(backend)?.rows_affected() > 0)
    }
}

fn backend(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(err.to_string())
}

fn entities_to_domain(entities: Vec<ExportJobEntity>) -> Result<Vec<ExportJob>, RepositoryError> {
    entities.into_iter().map(entity_to_domain).collect()
}

/// Convert a row into the domain model. Unknown enum strings are rejected
/// rather than defaulted, since a wrong status would re-run or hide a job.
fn entity_to_domain(entity: ExportJobEntity) -> Result<ExportJob, RepositoryError> {
    let status = entity
        .status
        .parse::<ExportJobStatus>()
        .map_err(RepositoryError::Backend)?;
    let failure_reason = entity
        .failure_reason
        .as_deref()
        .map(str::parse::<FailureReason>)
        .transpose()
        .map_err(RepositoryError::Backend)?;

    Ok(ExportJob {
        job_id: entity.job_id,
        tool_id: entity.tool_id,
        user_id: entity.user_id,
        status,
        steps_completed: entity.steps_completed,
        steps_total: entity.steps_total,
        current_step: entity.current_step,
        progress_percentage: entity.progress_percentage,
        package_path: entity.package_path,
        package_size_bytes: entity.package_size_bytes,
        package_checksum: entity.package_checksum,
        package_algorithm: entity.package_algorithm,
        checksum_verified_at: entity.checksum_verified_at,
        download_count: entity.download_count,
        last_downloaded_at: entity.last_downloaded_at,
        package_expires_at: entity.package_expires_at,
        package_retention_days: entity.package_retention_days,
        error_message: entity.error_message,
        failure_reason,
        corrupted_at: entity.corrupted_at,
        created_at: entity.created_at,
        updated_at: entity.updated_at,
        started_at: entity.started_at,
        completed_at: entity.completed_at,
    })
}
