//! Guarded status transitions for export jobs.

use chrono::{DateTime, Utc};
use domain::models::{ExportJob, ExportJobStatus};
use domain::services::{ExportJobStore, TransitionUpdate};
use metrics::counter;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::ExportError;

/// Applies legal status changes as single conditional updates.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn ExportJobStore>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn ExportJobStore>) -> Self {
        Self { store }
    }

    /// Move a job from `from` to `to`.
    ///
    /// Illegal edges fail without touching storage. A lost race fails with
    /// `InvalidStateTransition` carrying the status actually found.
    pub async fn transition(
        &self,
        job_id: Uuid,
        from: ExportJobStatus,
        to: ExportJobStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<ExportJob, ExportError> {
        if !from.can_transition_to(to) {
            return Err(ExportError::InvalidStateTransition { from, to });
        }

        if let Some(job) = self.store.transition(job_id, from, to, update, now).await? {
            debug!(job_id = %job_id, from = %from, to = %to, "Export job transitioned");
            if job.status.is_terminal() {
                counter!("export_jobs_finished_total", "status" => to.as_str()).increment(1);
            }
            return Ok(job);
        }

        match self.store.find_by_id(job_id).await? {
            Some(current) => Err(ExportError::InvalidStateTransition {
                from: current.status,
                to,
            }),
            None => Err(ExportError::NotFound(job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::services::InMemoryExportJobStore;

    async fn setup() -> (StateMachine, Arc<InMemoryExportJobStore>, ExportJob) {
        let store = Arc::new(InMemoryExportJobStore::new());
        let job = ExportJob::new_pending(Uuid::new_v4(), None, 4, None, 7, Utc::now());
        let job = store.insert_pending(job).await.unwrap();
        (StateMachine::new(store.clone()), store, job)
    }

    #[tokio::test]
    async fn test_legal_transition() {
        let (machine, _, job) = setup().await;
        let claimed = machine
            .transition(
                job.job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::InProgress,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, ExportJobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_illegal_edge_leaves_state_untouched() {
        let (machine, store, job) = setup().await;
        let err = machine
            .transition(
                job.job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::Completed,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExportError::InvalidStateTransition {
                from: ExportJobStatus::Pending,
                to: ExportJobStatus::Completed
            }
        ));

        let stored = store.find_by_id(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored, job);
    }

    #[tokio::test]
    async fn test_lost_race_reports_actual_status() {
        let (machine, _, job) = setup().await;
        machine
            .transition(
                job.job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::Cancelled,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap();

        let err = machine
            .transition(
                job.job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::InProgress,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExportError::InvalidStateTransition {
                from: ExportJobStatus::Cancelled,
                to: ExportJobStatus::InProgress
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_job() {
        let (machine, _, _) = setup().await;
        let err = machine
            .transition(
                Uuid::new_v4(),
                ExportJobStatus::Pending,
                ExportJobStatus::InProgress,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NotFound(_)));
    }
}
