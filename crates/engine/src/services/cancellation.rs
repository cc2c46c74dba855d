//! In-process cancellation flags for running export jobs.
//!
//! The flag only speeds up local observation. The persisted `CANCELLING`
//! status is what other processes see, and the executor checks both.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-job cancellation tokens.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        // The map holds no invariants a panicking holder could break.
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token for a job about to run on this process.
    pub fn register(&self, job_id: Uuid) -> CancellationToken {
        self.tokens().entry(job_id).or_default().clone()
    }

    /// Raise the flag of a locally running job. Returns `false` when no run
    /// registered `job_id` here; the persisted status then carries the
    /// request to whichever process owns the job.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, job_id: Uuid) -> bool {
        self.tokens()
            .get(&job_id)
            .map_or(false, CancellationToken::is_cancelled)
    }

    /// Forget the job once it reached a terminal status.
    pub fn release(&self, job_id: Uuid) {
        self.tokens().remove(&job_id);
    }

    pub fn tracked(&self) -> usize {
        self.tokens().len()
    }
}
