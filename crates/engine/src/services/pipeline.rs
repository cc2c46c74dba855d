//! Step pipeline executor.
//!
//! Runs a job's step plan in order, persisting progress after every step and
//! checking for cancellation at each boundary. Step failures trigger the
//! compensations of already completed steps in reverse order.

use chrono::Utc;
use domain::models::{
    CompletedPackage, ExportJob, ExportJobStatus, FailureReason, ToolDefinition,
};
use domain::services::{ExportJobStore, ToolRegistry, TransitionUpdate};
use metrics::histogram;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancellation::CancellationCoordinator;
use super::package_builder::PackageBuilder;
use super::state_machine::StateMachine;
use super::steps::{PlanFactory, StepContext, StepOutputs, StepPlan};
use crate::error::ExportError;

/// Drives export jobs from `PENDING` to a terminal status.
#[derive(Clone)]
pub struct PipelineExecutor {
    store: Arc<dyn ExportJobStore>,
    registry: Arc<dyn ToolRegistry>,
    machine: StateMachine,
    cancellations: Arc<CancellationCoordinator>,
    packages: Arc<PackageBuilder>,
    plans: PlanFactory,
}

/// A step that failed, with the error it returned.
struct StepFailure {
    step: &'static str,
    error: ExportError,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn ExportJobStore>,
        registry: Arc<dyn ToolRegistry>,
        cancellations: Arc<CancellationCoordinator>,
        packages: Arc<PackageBuilder>,
        plans: PlanFactory,
    ) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            registry,
            cancellations,
            packages,
            plans,
        }
    }

    /// Claim a `PENDING` job and run it to a terminal status.
    ///
    /// A job that fails or is cancelled still returns `Ok` with its final
    /// row. Errors mean the job could not be claimed or storage failed.
    pub async fn run(&self, job_id: Uuid) -> Result<ExportJob, ExportError> {
        let token = self.cancellations.register(job_id);
        let result = self.claim_and_run(job_id, &token).await;
        self.cancellations.release(job_id);
        result
    }

    async fn claim_and_run(
        &self,
        job_id: Uuid,
        token: &CancellationToken,
    ) -> Result<ExportJob, ExportError> {
        let job = self
            .machine
            .transition(
                job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::InProgress,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await?;

        info!(job_id = %job_id, tool_id = %job.tool_id, "Export job claimed");

        let Some(tool) = self.registry.get_tool(job.tool_id).await? else {
            let message = format!("Tool {} no longer exists", job.tool_id);
            return self
                .record_failure(job_id, message, FailureReason::ValidationFailed)
                .await;
        };

        let plan = (self.plans)(tool.tool_type);
        if plan.len() as i32 != job.steps_total {
            let message = format!(
                "Step plan for {} tools has {} steps, job expects {}",
                tool.tool_type,
                plan.len(),
                job.steps_total
            );
            return self
                .record_failure(job_id, message, FailureReason::ValidationFailed)
                .await;
        }

        self.execute_plan(&job, &tool, &plan, token).await
    }

    async fn execute_plan(
        &self,
        job: &ExportJob,
        tool: &ToolDefinition,
        plan: &StepPlan,
        token: &CancellationToken,
    ) -> Result<ExportJob, ExportError> {
        let ctx = StepContext {
            job,
            tool,
            attempt_id: Uuid::new_v4(),
            packages: &self.packages,
            registry: self.registry.as_ref(),
            cancellation: token,
        };
        let mut outputs = StepOutputs::default();

        if token.is_cancelled()
            || self.persisted_status(job.job_id).await? == ExportJobStatus::Cancelling
        {
            return self.finish_cancelled(plan, 0, &ctx, &outputs).await;
        }

        for (index, step) in plan.steps().iter().enumerate() {
            let name = step.name();
            debug!(job_id = %job.job_id, step = name, "Running export step");

            let started = Instant::now();
            let result = step.run(&ctx, &mut outputs).await;
            let elapsed = started.elapsed();
            histogram!("export_step_duration_seconds", "step" => name)
                .record(elapsed.as_secs_f64());

            if let Err(error) = result {
                warn!(
                    job_id = %job.job_id,
                    step = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "Export step failed"
                );
                let failure = StepFailure { step: name, error };
                return self.finish_failed(plan, index, &ctx, &outputs, failure).await;
            }

            let completed = index + 1;
            let progressed = self
                .store
                .record_progress(
                    job.job_id,
                    completed as i32,
                    plan.next_step_name(index),
                    Utc::now(),
                )
                .await?;
            let status = match progressed {
                Some(current) => current.status,
                None => self.persisted_status(job.job_id).await?,
            };

            debug!(
                job_id = %job.job_id,
                step = name,
                steps_completed = completed,
                elapsed_ms = elapsed.as_millis() as u64,
                "Export step completed"
            );

            if token.is_cancelled() || status == ExportJobStatus::Cancelling {
                return self.finish_cancelled(plan, completed, &ctx, &outputs).await;
            }
            if status != ExportJobStatus::InProgress {
                self.compensate(plan, completed, &ctx, &outputs).await;
                return Err(ExportError::InvalidStateTransition {
                    from: status,
                    to: ExportJobStatus::Completed,
                });
            }
        }

        self.finish_completed(plan, &ctx, &outputs).await
    }

    async fn finish_completed(
        &self,
        plan: &StepPlan,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Result<ExportJob, ExportError> {
        let job_id = ctx.job.job_id;
        let (Some(digest), Some(final_path)) = (&outputs.digest, &outputs.final_path) else {
            let failure = StepFailure {
                step: "commit",
                error: ExportError::Validation(
                    "Step plan finished without producing a package".to_string(),
                ),
            };
            return self
                .finish_failed(plan, plan.len(), ctx, outputs, failure)
                .await;
        };

        let now = Utc::now();
        let package = CompletedPackage {
            path: final_path.to_string_lossy().into_owned(),
            size_bytes: i64::try_from(digest.size_bytes).unwrap_or(i64::MAX),
            checksum: digest.checksum.clone(),
            algorithm: digest.algorithm.to_string(),
            verified_at: now,
        };

        match self
            .machine
            .transition(
                job_id,
                ExportJobStatus::InProgress,
                ExportJobStatus::Completed,
                TransitionUpdate::completed(package),
                now,
            )
            .await
        {
            Ok(job) => {
                info!(
                    job_id = %job_id,
                    tool_id = %job.tool_id,
                    size_bytes = digest.size_bytes,
                    "Export job completed"
                );
                Ok(job)
            }
            Err(ExportError::InvalidStateTransition {
                from: ExportJobStatus::Cancelling,
                ..
            }) => self.finish_cancelled(plan, plan.len(), ctx, outputs).await,
            Err(e) => {
                self.compensate(plan, plan.len(), ctx, outputs).await;
                Err(e)
            }
        }
    }

    /// Undo completed steps and record `FAILED` or `ROLLED_BACK`.
    async fn finish_failed(
        &self,
        plan: &StepPlan,
        completed: usize,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
        failure: StepFailure,
    ) -> Result<ExportJob, ExportError> {
        let job_id = ctx.job.job_id;
        let message = failure.error.to_string();
        let side_effects = plan.steps()[..completed]
            .iter()
            .any(|step| step.has_side_effects());

        if failure.error.is_validation() && !side_effects {
            self.remove_staging(job_id).await;
            return self
                .record_failure(job_id, message, FailureReason::ValidationFailed)
                .await;
        }

        // Failing steps remove their own partial output. With nothing to
        // compensate the job still ends ROLLED_BACK.
        let rollback_errors = self.compensate(plan, completed, ctx, outputs).await;
        self.remove_staging(job_id).await;

        if !rollback_errors.is_empty() {
            error!(
                job_id = %job_id,
                step = failure.step,
                rollback_errors = rollback_errors.len(),
                "Export rollback incomplete"
            );
            let message = format!(
                "{}; rollback errors: {}",
                message,
                rollback_errors.join("; ")
            );
            return self
                .record_failure(job_id, message, FailureReason::RollbackFailed)
                .await;
        }

        let failed = self
            .record_failure(job_id, message, FailureReason::StepFailed)
            .await?;
        if failed.status != ExportJobStatus::Failed {
            return Ok(failed);
        }

        let rolled_back = self
            .machine
            .transition(
                job_id,
                ExportJobStatus::Failed,
                ExportJobStatus::RolledBack,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await?;
        info!(job_id = %job_id, step = failure.step, "Export job rolled back");
        Ok(rolled_back)
    }

    /// Move an in-progress job to `FAILED`. A concurrent cancel wins and is
    /// finalized instead.
    async fn record_failure(
        &self,
        job_id: Uuid,
        message: String,
        reason: FailureReason,
    ) -> Result<ExportJob, ExportError> {
        match self
            .machine
            .transition(
                job_id,
                ExportJobStatus::InProgress,
                ExportJobStatus::Failed,
                TransitionUpdate::failed(message, reason),
                Utc::now(),
            )
            .await
        {
            Ok(job) => {
                info!(job_id = %job_id, reason = %reason, "Export job failed");
                Ok(job)
            }
            Err(ExportError::InvalidStateTransition {
                from: ExportJobStatus::Cancelling,
                ..
            }) => self.mark_cancelled(job_id).await,
            Err(e) => Err(e),
        }
    }

    async fn finish_cancelled(
        &self,
        plan: &StepPlan,
        completed: usize,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Result<ExportJob, ExportError> {
        let job_id = ctx.job.job_id;
        let errors = self.compensate(plan, completed, ctx, outputs).await;
        if !errors.is_empty() {
            warn!(
                job_id = %job_id,
                errors = %errors.join("; "),
                "Compensation after cancel left files behind"
            );
        }
        self.remove_staging(job_id).await;

        match self
            .machine
            .transition(
                job_id,
                ExportJobStatus::InProgress,
                ExportJobStatus::Cancelling,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
        {
            Ok(_) => {}
            Err(ExportError::InvalidStateTransition {
                from: ExportJobStatus::Cancelling,
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        let job = self.mark_cancelled(job_id).await?;
        info!(job_id = %job_id, steps_completed = job.steps_completed, "Export job cancelled");
        Ok(job)
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<ExportJob, ExportError> {
        self.machine
            .transition(
                job_id,
                ExportJobStatus::Cancelling,
                ExportJobStatus::Cancelled,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
    }

    /// Run rollbacks of the first `completed` steps, newest first. Returns
    /// the errors of rollbacks that failed.
    async fn compensate(
        &self,
        plan: &StepPlan,
        completed: usize,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for step in plan.steps()[..completed].iter().rev() {
            if let Err(e) = step.rollback(ctx, outputs).await {
                warn!(
                    job_id = %ctx.job.job_id,
                    step = step.name(),
                    error = %e,
                    "Export step rollback failed"
                );
                errors.push(format!("{}: {}", step.name(), e));
            }
        }
        errors
    }

    async fn remove_staging(&self, job_id: Uuid) {
        let dir = self.packages.staging_dir(job_id);
        if let Err(e) = self.packages.remove_dir_if_empty(&dir).await {
            warn!(job_id = %job_id, error = %e, "Failed to remove staging directory");
        }
    }

    async fn persisted_status(&self, job_id: Uuid) -> Result<ExportJobStatus, ExportError> {
        self.store
            .find_by_id(job_id)
            .await?
            .map(|job| job.status)
            .ok_or(ExportError::NotFound(job_id))
    }
}
