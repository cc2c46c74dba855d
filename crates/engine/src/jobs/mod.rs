//! Background job scheduler and job implementations.

mod export_worker;
mod retention_cleanup;
mod scheduler;

pub use export_worker::ExportWorkerJob;
pub use retention_cleanup::RetentionCleanupJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
