//! Domain models for tool exports.

pub mod export_job;
pub mod listing;
pub mod tool;

pub use export_job::{
    progress_percentage, CompletedPackage, ExportJob, ExportJobStatus, FailureReason,
    UnavailableReason, DEFAULT_PACKAGE_RETENTION_DAYS,
};
pub use listing::{
    ExportJobWithTool, JobListFilter, JobSortField, ListJobsQuery, ListJobsResponse, SortOrder,
};
pub use tool::{ToolAsset, ToolDefinition, ToolType};
