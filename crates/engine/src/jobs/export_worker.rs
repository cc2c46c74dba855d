//! Picks up pending export jobs and runs each on its own task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{Job, JobFrequency};
use crate::error::ExportError;
use crate::services::ExportService;

/// Background job dispatching `PENDING` exports.
pub struct ExportWorkerJob {
    service: ExportService,
    poll_interval_secs: u64,
    batch_size: i64,
    shutdown_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExportWorkerJob {
    pub fn new(
        service: ExportService,
        poll_interval_secs: u64,
        batch_size: i64,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            service,
            poll_interval_secs,
            batch_size,
            shutdown_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        lock(&self.in_flight)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        lock(&self.tasks)
    }

    /// Number of jobs currently running on this worker.
    pub fn running(&self) -> usize {
        self.in_flight().len()
    }

    /// Claim and spawn up to `batch_size` pending jobs. Returns how many
    /// were dispatched.
    pub async fn dispatch_pending(&self) -> Result<usize, ExportError> {
        let pending = self.service.pending_job_ids(self.batch_size).await?;

        let mut dispatched = 0;
        for job_id in pending {
            if !self.in_flight().insert(job_id) {
                continue;
            }

            let service = self.service.clone();
            let in_flight = self.in_flight.clone();
            let handle = tokio::spawn(async move {
                match service.run_job(job_id).await {
                    Ok(job) => info!(job_id = %job_id, status = %job.status, "Export job finished"),
                    Err(ExportError::InvalidStateTransition { from, .. }) => {
                        debug!(job_id = %job_id, status = %from, "Export job no longer pending")
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "Export job run failed"),
                }
                lock(&in_flight).remove(&job_id);
            });

            let mut tasks = self.tasks();
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl Job for ExportWorkerJob {
    fn name(&self) -> &'static str {
        "export_worker"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.poll_interval_secs)
    }

    async fn execute(&self) -> Result<(), ExportError> {
        let dispatched = self.dispatch_pending().await?;
        if dispatched > 0 {
            info!(
                dispatched = dispatched,
                running = self.running(),
                "Dispatched export jobs"
            );
        }
        Ok(())
    }

    /// Let running exports reach a step boundary and finish.
    async fn drain(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks());
        if tasks.is_empty() {
            return;
        }

        info!(running = tasks.len(), "Waiting for running export jobs");
        let all_done = futures::future::join_all(tasks);
        if tokio::time::timeout(self.shutdown_timeout, all_done)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Export jobs still running at shutdown"
            );
        }
    }
}
