//! Export service: the operations exposed to callers.

use chrono::{DateTime, Duration, Utc};
use domain::models::{
    ExportJob, ExportJobStatus, ExportJobWithTool, JobListFilter, ListJobsQuery,
    ListJobsResponse, ToolDefinition,
};
use domain::services::{ExportJobStore, ToolRegistry, TransitionUpdate};
use shared::pagination::{normalize_limit, normalize_offset, PageInfo};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::cancellation::CancellationCoordinator;
use super::download::{DownloadAccountant, PackageDownload};
use super::package_builder::PackageBuilder;
use super::pipeline::PipelineExecutor;
use super::retention::{RetentionSweeper, SweepReport};
use super::state_machine::StateMachine;
use super::steps::{PlanFactory, StepPlan};
use crate::config::Config;
use crate::error::ExportError;

/// Tunables resolved from configuration.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub storage_root: PathBuf,
    pub max_package_bytes: u64,
    pub retention_days: i32,
    pub grace_window: Duration,
    pub verification_freshness: Duration,
    pub sweep_batch_size: i64,
}

impl ExportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage_root: config.storage.root.clone(),
            max_package_bytes: config.storage.max_package_bytes,
            retention_days: config.retention.default_days,
            grace_window: Duration::minutes(config.retention.grace_window_minutes),
            verification_freshness: Duration::minutes(
                config.retention.verification_freshness_minutes,
            ),
            sweep_batch_size: config.retention.batch_size,
        }
    }
}

/// Service for export job operations.
#[derive(Clone)]
pub struct ExportService {
    store: Arc<dyn ExportJobStore>,
    registry: Arc<dyn ToolRegistry>,
    machine: StateMachine,
    cancellations: Arc<CancellationCoordinator>,
    packages: Arc<PackageBuilder>,
    plans: PlanFactory,
    executor: PipelineExecutor,
    downloads: DownloadAccountant,
    sweeper: RetentionSweeper,
    settings: ExportSettings,
}

impl ExportService {
    pub fn new(
        store: Arc<dyn ExportJobStore>,
        registry: Arc<dyn ToolRegistry>,
        settings: ExportSettings,
    ) -> Self {
        Self::new_with_plans(store, registry, settings, StepPlan::default_factory())
    }

    /// Like [`ExportService::new`] with a custom step plan per tool type.
    pub fn new_with_plans(
        store: Arc<dyn ExportJobStore>,
        registry: Arc<dyn ToolRegistry>,
        settings: ExportSettings,
        plans: PlanFactory,
    ) -> Self {
        let cancellations = Arc::new(CancellationCoordinator::new());
        let packages = Arc::new(PackageBuilder::new(
            settings.storage_root.clone(),
            settings.max_package_bytes,
        ));

        let executor = PipelineExecutor::new(
            store.clone(),
            registry.clone(),
            cancellations.clone(),
            packages.clone(),
            plans.clone(),
        );
        let downloads = DownloadAccountant::new(store.clone());
        let sweeper = RetentionSweeper::new(
            store.clone(),
            packages.clone(),
            settings.grace_window,
            settings.verification_freshness,
            settings.sweep_batch_size,
        );

        Self {
            machine: StateMachine::new(store.clone()),
            store,
            registry,
            cancellations,
            packages,
            plans,
            executor,
            downloads,
            sweeper,
            settings,
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn packages(&self) -> &PackageBuilder {
        &self.packages
    }

    /// Create a `PENDING` export job for `tool_id`.
    pub async fn create_export_job(
        &self,
        tool_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<ExportJob, ExportError> {
        self.create_export_job_at(tool_id, user_id, Utc::now()).await
    }

    pub async fn create_export_job_at(
        &self,
        tool_id: Uuid,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<ExportJob, ExportError> {
        let tool = self
            .registry
            .get_tool(tool_id)
            .await?
            .ok_or(ExportError::ToolNotFound(tool_id))?;

        let plan = (self.plans)(tool.tool_type);
        let job = ExportJob::new_pending(
            tool_id,
            user_id,
            plan.len() as i32,
            plan.first_step_name(),
            self.settings.retention_days,
            now,
        );

        let job = self.store.insert_pending(job).await?;
        info!(
            job_id = %job.job_id,
            tool_id = %tool_id,
            tool_type = %tool.tool_type,
            steps_total = job.steps_total,
            "Export job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ExportJob, ExportError> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or(ExportError::NotFound(job_id))
    }

    /// List jobs with filtering, sorting and offset pagination.
    pub async fn list_jobs(&self, query: &ListJobsQuery) -> Result<ListJobsResponse, ExportError> {
        let statuses = query.statuses().map_err(ExportError::Validation)?;
        let tool_type = query.tool_type().map_err(ExportError::Validation)?;

        if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
            if start > end {
                return Err(ExportError::Validation(
                    "startDate must not be after endDate".to_string(),
                ));
            }
        }

        let tool_ids = match tool_type {
            Some(tool_type) => Some(self.registry.tool_ids_by_type(tool_type).await?),
            None => None,
        };

        let filter = JobListFilter {
            statuses,
            tool_ids,
            user_id: query.user_id,
            created_from: query.start_date,
            created_to: query.end_date,
            sort_by: query.sort_by,
            sort_order: query.sort_order,
            limit: normalize_limit(query.limit),
            offset: normalize_offset(query.offset),
        };

        let (jobs, total) = self.store.list(&filter).await?;

        let mut tools: HashMap<Uuid, Option<ToolDefinition>> = HashMap::new();
        let mut items = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !tools.contains_key(&job.tool_id) {
                let tool = self.registry.get_tool(job.tool_id).await?;
                tools.insert(job.tool_id, tool);
            }
            let tool = tools.get(&job.tool_id).and_then(Option::as_ref);
            items.push(ExportJobWithTool::new(job, tool));
        }

        Ok(ListJobsResponse::new(
            items,
            PageInfo::new(total, filter.limit, filter.offset),
        ))
    }

    /// Request cancellation of a job.
    ///
    /// `PENDING` jobs are cancelled directly, `IN_PROGRESS` jobs move to
    /// `CANCELLING` and finish at the executor's next step boundary.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<ExportJob, ExportError> {
        self.cancel_job_at(job_id, Utc::now()).await
    }

    pub async fn cancel_job_at(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExportJob, ExportError> {
        let mut job = self.get_job(job_id).await?;

        loop {
            let next = match job.status {
                ExportJobStatus::Pending => ExportJobStatus::Cancelled,
                ExportJobStatus::InProgress => ExportJobStatus::Cancelling,
                ExportJobStatus::Cancelling => return Ok(job),
                status => return Err(ExportError::AlreadyTerminal { job_id, status }),
            };

            match self
                .machine
                .transition(job_id, job.status, next, TransitionUpdate::default(), now)
                .await
            {
                Ok(updated) => {
                    // Only a run on this process holds a token; others see
                    // the persisted status at their next step boundary.
                    let local = updated.status == ExportJobStatus::Cancelling
                        && self.cancellations.cancel(job_id);
                    info!(
                        job_id = %job_id,
                        status = %updated.status,
                        local = local,
                        "Export job cancel requested"
                    );
                    return Ok(updated);
                }
                // Lost a race with the worker; act on whatever it left.
                Err(ExportError::InvalidStateTransition { .. }) => {
                    job = self.get_job(job_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a completed job's package for streaming.
    pub async fn download_package(&self, job_id: Uuid) -> Result<PackageDownload, ExportError> {
        self.download_package_at(job_id, Utc::now()).await
    }

    pub async fn download_package_at(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PackageDownload, ExportError> {
        self.downloads.download(job_id, now).await
    }

    /// Run a `PENDING` job to completion on the current task.
    pub async fn run_job(&self, job_id: Uuid) -> Result<ExportJob, ExportError> {
        self.executor.run(job_id).await
    }

    /// Delete a terminal job's row and files.
    pub async fn purge_job(&self, job_id: Uuid) -> Result<(), ExportError> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(ExportError::Validation(format!(
                "Only finished jobs can be purged; job {} is {}",
                job_id, job.status
            )));
        }

        self.packages.purge_job_files(job_id).await?;
        self.store.delete(job_id).await?;

        info!(job_id = %job_id, tool_id = %job.tool_id, "Export job purged");
        Ok(())
    }

    pub async fn run_retention(&self) -> Result<SweepReport, ExportError> {
        self.run_retention_at(Utc::now()).await
    }

    pub async fn run_retention_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ExportError> {
        self.sweeper.run_at(now).await
    }

    /// Ids of the oldest `PENDING` jobs.
    pub async fn pending_job_ids(&self, limit: i64) -> Result<Vec<Uuid>, ExportError> {
        Ok(self
            .store
            .find_pending(limit)
            .await?
            .into_iter()
            .map(|job| job.job_id)
            .collect())
    }
}
