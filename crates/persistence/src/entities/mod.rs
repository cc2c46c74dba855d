//! Database row mappings.

pub mod export_job;
pub mod tool;

pub use export_job::ExportJobEntity;
pub use tool::{ToolAssetEntity, ToolEntity};
