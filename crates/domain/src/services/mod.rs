//! Storage abstractions and in-memory implementations.

pub mod job_store;
pub mod memory_store;
pub mod tool_registry;

pub use job_store::{ExportJobStore, RepositoryError, TransitionUpdate};
pub use memory_store::InMemoryExportJobStore;
pub use tool_registry::{InMemoryToolRegistry, ToolRegistry};
