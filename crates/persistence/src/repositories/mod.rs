//! Postgres implementations of the domain storage traits.

pub mod export_job;
pub mod tool;

pub use export_job::PgExportJobStore;
pub use tool::PgToolRegistry;
