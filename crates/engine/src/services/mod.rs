//! Business logic services.

pub mod cancellation;
pub mod checksum;
pub mod download;
pub mod export_service;
pub mod package_builder;
pub mod pipeline;
pub mod retention;
pub mod state_machine;
pub mod steps;

pub use cancellation::CancellationCoordinator;
pub use download::{DownloadAccountant, PackageDownload};
pub use export_service::{ExportService, ExportSettings};
pub use package_builder::PackageBuilder;
pub use pipeline::PipelineExecutor;
pub use retention::{RetentionSweeper, SweepReport};
pub use state_machine::StateMachine;
pub use steps::{ExportStep, PlanFactory, StepContext, StepOutputs, StepPlan};
