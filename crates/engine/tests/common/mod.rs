//! Shared fixtures for export engine integration tests.
//!
//! Everything runs against the in-memory job store and tool registry, with
//! package files under a fresh temporary directory per test.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use domain::models::{
    ExportJob, ExportJobStatus, JobListFilter, ToolAsset, ToolDefinition, ToolType,
};
use domain::services::{
    ExportJobStore, InMemoryExportJobStore, InMemoryToolRegistry, RepositoryError,
    TransitionUpdate,
};
use fake::faker::company::en::CompanyName;
use fake::Fake;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use tool_export_engine::error::ExportError;
use tool_export_engine::services::{
    ExportService, ExportSettings, ExportStep, PlanFactory, StepContext, StepOutputs, StepPlan,
};

/// Service wired to in-memory storage plus handles for inspecting it.
pub struct TestHarness {
    pub service: ExportService,
    pub store: Arc<RecordingStore>,
    pub registry: Arc<InMemoryToolRegistry>,
    dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(|_| {}, StepPlan::default_factory())
    }

    pub fn with_plans(plans: PlanFactory) -> Self {
        Self::build(|_| {}, plans)
    }

    pub fn with_settings(configure: impl FnOnce(&mut ExportSettings)) -> Self {
        Self::build(configure, StepPlan::default_factory())
    }

    pub fn build(configure: impl FnOnce(&mut ExportSettings), plans: PlanFactory) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut settings = ExportSettings {
            storage_root: dir.path().join("exports"),
            max_package_bytes: 10 * 1024 * 1024,
            retention_days: 7,
            grace_window: Duration::minutes(60),
            // Every live package is due for the integrity sweep.
            verification_freshness: Duration::zero(),
            sweep_batch_size: 50,
        };
        configure(&mut settings);

        let store = Arc::new(RecordingStore::default());
        let registry = Arc::new(InMemoryToolRegistry::new());
        let service =
            ExportService::new_with_plans(store.clone(), registry.clone(), settings, plans);

        Self {
            service,
            store,
            registry,
            dir,
        }
    }

    pub fn exports_root(&self) -> PathBuf {
        self.dir.path().join("exports")
    }

    /// Write an asset source file outside the export root.
    pub fn write_source(&self, name: &str, contents: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("sources");
        std::fs::create_dir_all(&dir).expect("Failed to create sources dir");
        let path = dir.join(name);
        std::fs::write(&path, contents).expect("Failed to write source file");
        path
    }

    pub fn register(&self, tool: ToolDefinition) -> ToolDefinition {
        self.registry.upsert(tool.clone());
        tool
    }

    pub fn form_tool(&self) -> ToolDefinition {
        let logo = self.write_source(
            &format!("{}.svg", Uuid::new_v4()),
            b"<svg viewBox=\"0 0 1 1\"/>",
        );
        let mut tool = tool_definition(
            ToolType::Form,
            json!({ "fields": [{ "name": "email", "type": "email", "required": true }] }),
        );
        tool.assets = vec![ToolAsset {
            name: "logo.svg".to_string(),
            source_path: logo,
        }];
        self.register(tool)
    }

    pub fn workflow_tool(&self, dependencies: Vec<Uuid>) -> ToolDefinition {
        let mut tool = tool_definition(
            ToolType::Workflow,
            json!({ "nodes": [{ "id": "start" }, { "id": "approve" }] }),
        );
        tool.dependencies = dependencies;
        self.register(tool)
    }

    pub fn theme_tool(&self) -> ToolDefinition {
        self.register(tool_definition(
            ToolType::Theme,
            json!({ "palette": { "primary": "#1a73e8", "surface": "#ffffff" } }),
        ))
    }

    /// Create and run a job for `tool` in one go.
    pub async fn export(&self, tool: &ToolDefinition) -> ExportJob {
        let job = self
            .service
            .create_export_job(tool.id, Some(Uuid::new_v4()))
            .await
            .expect("Failed to create export job");
        self.service
            .run_job(job.job_id)
            .await
            .expect("Failed to run export job")
    }

    /// Move a pending job to `IN_PROGRESS` without running any step.
    pub async fn claim(&self, job_id: Uuid) -> ExportJob {
        self.store
            .transition(
                job_id,
                ExportJobStatus::Pending,
                ExportJobStatus::InProgress,
                TransitionUpdate::default(),
                Utc::now(),
            )
            .await
            .expect("store error")
            .expect("job was not pending")
    }
}

pub fn tool_definition(tool_type: ToolType, config: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        id: Uuid::new_v4(),
        name: CompanyName().fake(),
        tool_type,
        description: Some(format!("Exported {} for testing", tool_type)),
        config,
        assets: vec![],
        dependencies: vec![],
    }
}

/// Entry names of a `.tar.gz` package.
pub fn archive_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).expect("Failed to open package");
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive
        .entries()
        .expect("Failed to read archive")
        .map(|entry| {
            let entry = entry.expect("Bad archive entry");
            entry.path().expect("Bad entry path").to_string_lossy().into_owned()
        })
        .collect()
}

/// Contents of one entry of a `.tar.gz` package.
pub fn archive_entry(path: &Path, name: &str) -> Option<String> {
    let file = std::fs::File::open(path).expect("Failed to open package");
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in archive.entries().expect("Failed to read archive") {
        let mut entry = entry.expect("Bad archive entry");
        if entry.path().expect("Bad entry path").to_string_lossy() == name {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).expect("Failed to read entry");
            return Some(contents);
        }
    }
    None
}

pub fn is_legal_path(statuses: &[ExportJobStatus]) -> bool {
    statuses.first() == Some(&ExportJobStatus::Pending)
        && statuses
            .windows(2)
            .all(|pair| pair[0] == pair[1] || pair[0].can_transition_to(pair[1]))
}

// ---------------------------------------------------------------------------
// Instrumented store
// ---------------------------------------------------------------------------

/// In-memory store that keeps every job snapshot it hands back.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryExportJobStore,
    snapshots: Mutex<Vec<ExportJob>>,
}

impl RecordingStore {
    fn keep(&self, job: &ExportJob) {
        self.snapshots.lock().unwrap().push(job.clone());
    }

    /// Every observed version of `job_id`, oldest first.
    pub fn history(&self, job_id: Uuid) -> Vec<ExportJob> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn status_history(&self, job_id: Uuid) -> Vec<ExportJobStatus> {
        let mut statuses: Vec<ExportJobStatus> = Vec::new();
        for job in self.history(job_id) {
            if statuses.last() != Some(&job.status) {
                statuses.push(job.status);
            }
        }
        statuses
    }
}

#[async_trait::async_trait]
impl ExportJobStore for RecordingStore {
    async fn insert_pending(&self, job: ExportJob) -> Result<ExportJob, RepositoryError> {
        let job = self.inner.insert_pending(job).await?;
        self.keep(&job);
        Ok(job)
    }

    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<ExportJob>, RepositoryError> {
        self.inner.find_by_id(job_id).await
    }

    async fn find_active_for_tool(
        &self,
        tool_id: Uuid,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        self.inner.find_active_for_tool(tool_id).await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: ExportJobStatus,
        to: ExportJobStatus,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let job = self.inner.transition(job_id, from, to, update, now).await?;
        if let Some(job) = &job {
            self.keep(job);
        }
        Ok(job)
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        steps_completed: i32,
        current_step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        let job = self
            .inner
            .record_progress(job_id, steps_completed, current_step, now)
            .await?;
        if let Some(job) = &job {
            self.keep(job);
        }
        Ok(job)
    }

    async fn record_download(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportJob>, RepositoryError> {
        self.inner.record_download(job_id, now).await
    }

    async fn record_verification(
        &self,
        job_id: Uuid,
        verified_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.record_verification(job_id, verified_at).await
    }

    async fn flag_corrupted(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.flag_corrupted(job_id, now).await
    }

    async fn find_expired_packages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        self.inner.find_expired_packages(now, limit).await
    }

    async fn find_stale_verifications(
        &self,
        verified_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJob>, RepositoryError> {
        self.inner
            .find_stale_verifications(verified_before, now, limit)
            .await
    }

    async fn clear_package(
        &self,
        job_id: Uuid,
        package_path: &str,
    ) -> Result<bool, RepositoryError> {
        self.inner.clear_package(job_id, package_path).await
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<ExportJob>, RepositoryError> {
        self.inner.find_pending(limit).await
    }

    async fn list(
        &self,
        filter: &JobListFilter,
    ) -> Result<(Vec<ExportJob>, i64), RepositoryError> {
        self.inner.list(filter).await
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, RepositoryError> {
        self.inner.delete(job_id).await
    }
}

// ---------------------------------------------------------------------------
// Scripted steps
// ---------------------------------------------------------------------------

/// Wraps a step and parks it until the test releases it.
pub struct GatedStep {
    pub inner: Box<dyn ExportStep>,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ExportStep for GatedStep {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn idempotent(&self) -> bool {
        self.inner.idempotent()
    }

    fn has_side_effects(&self) -> bool {
        self.inner.has_side_effects()
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.run(ctx, outputs).await
    }

    async fn rollback(
        &self,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Result<(), ExportError> {
        self.inner.rollback(ctx, outputs).await
    }
}

/// Always fails with a transient error.
pub struct FailingStep {
    pub name: &'static str,
}

#[async_trait::async_trait]
impl ExportStep for FailingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(
        &self,
        _ctx: &StepContext<'_>,
        _outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        Err(ExportError::TransientIo(format!("simulated {} failure", self.name)))
    }
}

/// Claims side effects it then cannot undo.
pub struct StickyStep;

#[async_trait::async_trait]
impl ExportStep for StickyStep {
    fn name(&self) -> &'static str {
        "reserve-slot"
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn run(
        &self,
        _ctx: &StepContext<'_>,
        _outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        Ok(())
    }

    async fn rollback(
        &self,
        _ctx: &StepContext<'_>,
        _outputs: &StepOutputs,
    ) -> Result<(), ExportError> {
        Err(ExportError::TransientIo("slot could not be released".to_string()))
    }
}
