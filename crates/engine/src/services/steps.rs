//! Export steps and the per-tool-type step plans.

use domain::models::{ExportJob, ToolDefinition, ToolType};
use domain::services::ToolRegistry;
use serde_json::json;
use shared::validation::slugify;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

use super::checksum::{self, PackageDigest};
use super::package_builder::{ArchiveAsset, ArchiveContents, BuiltPackage, PackageBuilder};
use crate::error::ExportError;

pub const VALIDATE_CONFIG: &str = "validate-config";
pub const RESOLVE_DEPENDENCIES: &str = "resolve-dependencies";
pub const COLLECT_ASSETS: &str = "collect-assets";
pub const BUNDLE_ARCHIVE: &str = "bundle-archive";
pub const COMPUTE_CHECKSUM: &str = "compute-checksum";
pub const PERSIST_RECORD: &str = "persist-record";

const MANIFEST_FORMAT_VERSION: u32 = 1;

/// What a step sees while it runs.
pub struct StepContext<'a> {
    pub job: &'a ExportJob,
    pub tool: &'a ToolDefinition,
    /// Unique per run; scopes files written by non-idempotent steps.
    pub attempt_id: Uuid,
    pub packages: &'a PackageBuilder,
    pub registry: &'a dyn ToolRegistry,
    /// Raised when cancellation is requested. Built-in steps do not poll it.
    pub cancellation: &'a CancellationToken,
}

/// Results accumulated across steps.
#[derive(Debug, Default)]
pub struct StepOutputs {
    pub assets: Vec<ArchiveAsset>,
    pub dependencies: Option<serde_json::Value>,
    pub staged: Option<BuiltPackage>,
    pub digest: Option<PackageDigest>,
    pub final_path: Option<PathBuf>,
}

/// One unit of pipeline work with an optional compensating action.
#[async_trait::async_trait]
pub trait ExportStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether running twice has the same effect as running once.
    fn idempotent(&self) -> bool {
        true
    }

    /// Whether the step leaves anything behind that rollback must undo.
    fn has_side_effects(&self) -> bool {
        false
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError>;

    /// Undo whatever `run` left behind. Only called after `run` succeeded.
    async fn rollback(
        &self,
        _ctx: &StepContext<'_>,
        _outputs: &StepOutputs,
    ) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Rejects malformed tool configuration before anything is written.
pub struct ValidateConfigStep;

#[async_trait::async_trait]
impl ExportStep for ValidateConfigStep {
    fn name(&self) -> &'static str {
        VALIDATE_CONFIG
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        _outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let tool = ctx.tool;
        tool.validate()?;

        let config = tool.config.as_object().ok_or_else(|| {
            ExportError::Validation("Tool configuration must be a JSON object".to_string())
        })?;

        let key = tool.tool_type.required_config_key();
        let section = config.get(key).ok_or_else(|| {
            ExportError::Validation(format!(
                "{} configuration is missing \"{}\"",
                tool.tool_type, key
            ))
        })?;

        let (well_formed, expected) = match tool.tool_type {
            ToolType::Form | ToolType::Workflow => (section.is_array(), "an array"),
            ToolType::Theme => (section.is_object(), "an object"),
        };
        if !well_formed {
            return Err(ExportError::Validation(format!(
                "\"{}\" must be {}",
                key, expected
            )));
        }

        let mut seen = HashSet::new();
        for asset in &tool.assets {
            if !seen.insert(asset.name.as_str()) {
                return Err(ExportError::Validation(format!(
                    "Duplicate asset name: {}",
                    asset.name
                )));
            }
        }

        Ok(())
    }
}

/// Looks up every tool a workflow references.
pub struct ResolveDependenciesStep;

#[async_trait::async_trait]
impl ExportStep for ResolveDependenciesStep {
    fn name(&self) -> &'static str {
        RESOLVE_DEPENDENCIES
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for &dependency_id in &ctx.tool.dependencies {
            if dependency_id == ctx.tool.id {
                return Err(ExportError::Validation(
                    "A workflow cannot depend on itself".to_string(),
                ));
            }
            if !seen.insert(dependency_id) {
                continue;
            }

            let dependency = ctx.registry.get_tool(dependency_id).await?.ok_or_else(|| {
                ExportError::Validation(format!(
                    "Workflow depends on unknown tool {}",
                    dependency_id
                ))
            })?;

            resolved.push(json!({
                "id": dependency.id,
                "name": dependency.name,
                "toolType": dependency.tool_type,
            }));
        }

        outputs.dependencies = Some(serde_json::Value::Array(resolved));
        Ok(())
    }
}

/// Checks every asset source exists and records its size.
pub struct CollectAssetsStep;

#[async_trait::async_trait]
impl ExportStep for CollectAssetsStep {
    fn name(&self) -> &'static str {
        COLLECT_ASSETS
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let mut collected = Vec::with_capacity(ctx.tool.assets.len());

        for asset in &ctx.tool.assets {
            let metadata = match tokio::fs::metadata(&asset.source_path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ExportError::Validation(format!(
                        "Asset {} not found at {}",
                        asset.name,
                        asset.source_path.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            if !metadata.is_file() {
                return Err(ExportError::Validation(format!(
                    "Asset {} is not a regular file",
                    asset.name
                )));
            }

            collected.push(ArchiveAsset {
                name: asset.name.clone(),
                source_path: asset.source_path.clone(),
                size_bytes: metadata.len(),
            });
        }

        outputs.assets = collected;
        Ok(())
    }
}

/// Writes the archive to an attempt-scoped staging path.
pub struct BundleArchiveStep;

impl BundleArchiveStep {
    fn manifest(ctx: &StepContext<'_>, outputs: &StepOutputs) -> serde_json::Value {
        json!({
            "formatVersion": MANIFEST_FORMAT_VERSION,
            "jobId": ctx.job.job_id,
            "toolId": ctx.tool.id,
            "toolName": ctx.tool.name,
            "toolType": ctx.tool.tool_type,
            "description": ctx.tool.description,
            "assets": outputs.assets.iter().map(|a| &a.name).collect::<Vec<_>>(),
            "createdAt": ctx.job.created_at,
        })
    }
}

#[async_trait::async_trait]
impl ExportStep for BundleArchiveStep {
    fn name(&self) -> &'static str {
        BUNDLE_ARCHIVE
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let contents = ArchiveContents {
            manifest: Self::manifest(ctx, outputs),
            config: ctx.tool.config.clone(),
            dependencies: outputs.dependencies.clone(),
            assets: outputs.assets.clone(),
        };

        let staging_path = ctx.packages.staging_path(ctx.job.job_id, ctx.attempt_id);
        outputs.staged = Some(ctx.packages.build(contents, staging_path).await?);
        Ok(())
    }

    async fn rollback(
        &self,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Result<(), ExportError> {
        if let Some(staged) = &outputs.staged {
            ctx.packages.remove_file(&staged.path).await?;
        }
        ctx.packages
            .remove_dir_if_empty(&ctx.packages.staging_dir(ctx.job.job_id))
            .await
    }
}

/// Hashes the staged archive.
pub struct ComputeChecksumStep;

#[async_trait::async_trait]
impl ExportStep for ComputeChecksumStep {
    fn name(&self) -> &'static str {
        COMPUTE_CHECKSUM
    }

    async fn run(
        &self,
        _ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let staged = outputs
            .staged
            .as_ref()
            .ok_or_else(|| ExportError::TransientIo("No staged archive to hash".to_string()))?;

        outputs.digest = Some(checksum::compute(&staged.path).await?);
        Ok(())
    }
}

/// Moves the staged archive into the job's directory. The row itself is
/// written by the executor's completion commit.
pub struct PersistRecordStep;

#[async_trait::async_trait]
impl ExportStep for PersistRecordStep {
    fn name(&self) -> &'static str {
        PERSIST_RECORD
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        outputs: &mut StepOutputs,
    ) -> Result<(), ExportError> {
        let staged = outputs
            .staged
            .as_ref()
            .ok_or_else(|| ExportError::TransientIo("No staged archive to persist".to_string()))?;

        let final_path = ctx
            .packages
            .final_path(ctx.job.job_id, &slugify(&ctx.tool.name));
        ctx.packages.promote(&staged.path, &final_path).await?;
        ctx.packages
            .remove_dir_if_empty(&ctx.packages.staging_dir(ctx.job.job_id))
            .await?;

        outputs.final_path = Some(final_path);
        Ok(())
    }

    async fn rollback(
        &self,
        ctx: &StepContext<'_>,
        outputs: &StepOutputs,
    ) -> Result<(), ExportError> {
        if let Some(final_path) = &outputs.final_path {
            ctx.packages.remove_file(final_path).await?;
        }
        ctx.packages
            .remove_dir_if_empty(&ctx.packages.job_dir(ctx.job.job_id))
            .await
    }
}

/// Ordered steps for one job.
pub struct StepPlan {
    steps: Vec<Box<dyn ExportStep>>,
}

/// Builds the plan for a tool type. Swappable so callers can run custom plans.
pub type PlanFactory = Arc<dyn Fn(ToolType) -> StepPlan + Send + Sync>;

impl StepPlan {
    pub fn new(steps: Vec<Box<dyn ExportStep>>) -> Self {
        Self { steps }
    }

    /// The fixed plan for each kind of tool.
    pub fn for_tool_type(tool_type: ToolType) -> Self {
        let steps: Vec<Box<dyn ExportStep>> = match tool_type {
            ToolType::Form => vec![
                Box::new(ValidateConfigStep),
                Box::new(CollectAssetsStep),
                Box::new(BundleArchiveStep),
                Box::new(ComputeChecksumStep),
                Box::new(PersistRecordStep),
            ],
            ToolType::Workflow => vec![
                Box::new(ValidateConfigStep),
                Box::new(ResolveDependenciesStep),
                Box::new(CollectAssetsStep),
                Box::new(BundleArchiveStep),
                Box::new(ComputeChecksumStep),
                Box::new(PersistRecordStep),
            ],
            ToolType::Theme => vec![
                Box::new(ValidateConfigStep),
                Box::new(BundleArchiveStep),
                Box::new(ComputeChecksumStep),
                Box::new(PersistRecordStep),
            ],
        };
        Self::new(steps)
    }

    pub fn default_factory() -> PlanFactory {
        Arc::new(StepPlan::for_tool_type)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Box<dyn ExportStep>] {
        &self.steps
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn first_step_name(&self) -> Option<&'static str> {
        self.steps.first().map(|s| s.name())
    }

    /// Name of the step after `index`, if any.
    pub fn next_step_name(&self, index: usize) -> Option<&'static str> {
        self.steps.get(index + 1).map(|s| s.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::models::ToolAsset;
    use domain::services::InMemoryToolRegistry;

    fn tool(tool_type: ToolType, config: serde_json::Value) -> ToolDefinition {
        ToolDefinition {
            id: Uuid::new_v4(),
            name: "Customer Survey".to_string(),
            tool_type,
            description: Some("Quarterly survey".to_string()),
            config,
            assets: vec![],
            dependencies: vec![],
        }
    }

    struct Fixture {
        job: ExportJob,
        packages: PackageBuilder,
        registry: InMemoryToolRegistry,
        token: CancellationToken,
        _root: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            Self {
                job: ExportJob::new_pending(Uuid::new_v4(), None, 5, None, 7, Utc::now()),
                packages: PackageBuilder::new(root.path(), 10 * 1024 * 1024),
                registry: InMemoryToolRegistry::new(),
                token: CancellationToken::new(),
                _root: root,
            }
        }

        fn ctx<'a>(&'a self, tool: &'a ToolDefinition) -> StepContext<'a> {
            StepContext {
                job: &self.job,
                tool,
                attempt_id: Uuid::new_v4(),
                packages: &self.packages,
                registry: &self.registry,
                cancellation: &self.token,
            }
        }
    }

    #[test]
    fn test_plans_per_tool_type() {
        assert_eq!(
            StepPlan::for_tool_type(ToolType::Form).names(),
            vec![VALIDATE_CONFIG, COLLECT_ASSETS, BUNDLE_ARCHIVE, COMPUTE_CHECKSUM, PERSIST_RECORD]
        );
        assert_eq!(
            StepPlan::for_tool_type(ToolType::Workflow).names(),
            vec![
                VALIDATE_CONFIG,
                RESOLVE_DEPENDENCIES,
                COLLECT_ASSETS,
                BUNDLE_ARCHIVE,
                COMPUTE_CHECKSUM,
                PERSIST_RECORD
            ]
        );
        assert_eq!(
            StepPlan::for_tool_type(ToolType::Theme).names(),
            vec![VALIDATE_CONFIG, BUNDLE_ARCHIVE, COMPUTE_CHECKSUM, PERSIST_RECORD]
        );
    }

    #[test]
    fn test_plan_navigation() {
        let plan = StepPlan::for_tool_type(ToolType::Theme);
        assert_eq!(plan.first_step_name(), Some(VALIDATE_CONFIG));
        assert_eq!(plan.next_step_name(0), Some(BUNDLE_ARCHIVE));
        assert_eq!(plan.next_step_name(3), None);
        assert!(!plan.is_empty());
        assert!(StepPlan::new(vec![]).first_step_name().is_none());
    }

    #[test]
    fn test_side_effect_declarations() {
        assert!(BundleArchiveStep.has_side_effects());
        assert!(!BundleArchiveStep.idempotent());
        assert!(PersistRecordStep.has_side_effects());
        assert!(!ValidateConfigStep.has_side_effects());
        assert!(!ComputeChecksumStep.has_side_effects());
    }

    #[tokio::test]
    async fn test_validate_config_accepts_well_formed_tools() {
        let fixture = Fixture::new();
        for tool in [
            tool(ToolType::Form, json!({ "fields": [] })),
            tool(ToolType::Workflow, json!({ "nodes": [{ "id": "start" }] })),
            tool(ToolType::Theme, json!({ "palette": { "primary": "#0af" } })),
        ] {
            let mut outputs = StepOutputs::default();
            ValidateConfigStep
                .run(&fixture.ctx(&tool), &mut outputs)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_validate_config_rejects_malformed_config() {
        let fixture = Fixture::new();
        let cases = [
            tool(ToolType::Form, json!(["not", "an", "object"])),
            tool(ToolType::Form, json!({ "nodes": [] })),
            tool(ToolType::Form, json!({ "fields": {} })),
            tool(ToolType::Theme, json!({ "palette": [] })),
        ];

        for tool in cases {
            let mut outputs = StepOutputs::default();
            let err = ValidateConfigStep
                .run(&fixture.ctx(&tool), &mut outputs)
                .await
                .unwrap_err();
            assert!(err.is_validation(), "unexpected error: {}", err);
        }
    }

    #[tokio::test]
    async fn test_validate_config_rejects_duplicate_assets() {
        let fixture = Fixture::new();
        let mut tool = tool(ToolType::Form, json!({ "fields": [] }));
        let asset = ToolAsset {
            name: "logo.png".to_string(),
            source_path: PathBuf::from("/srv/logo.png"),
        };
        tool.assets = vec![asset.clone(), asset];

        let err = ValidateConfigStep
            .run(&fixture.ctx(&tool), &mut StepOutputs::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate asset name"));
    }

    #[tokio::test]
    async fn test_resolve_dependencies() {
        let fixture = Fixture::new();
        let dependency = tool(ToolType::Form, json!({ "fields": [] }));
        fixture.registry.upsert(dependency.clone());

        let mut workflow = tool(ToolType::Workflow, json!({ "nodes": [] }));
        workflow.dependencies = vec![dependency.id, dependency.id];

        let mut outputs = StepOutputs::default();
        ResolveDependenciesStep
            .run(&fixture.ctx(&workflow), &mut outputs)
            .await
            .unwrap();

        let resolved = outputs.dependencies.unwrap();
        assert_eq!(resolved.as_array().unwrap().len(), 1);
        assert_eq!(resolved[0]["toolType"], "form");

        workflow.dependencies = vec![Uuid::new_v4()];
        let err = ResolveDependenciesStep
            .run(&fixture.ctx(&workflow), &mut StepOutputs::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_collect_assets_reports_missing_source() {
        let fixture = Fixture::new();
        let mut form = tool(ToolType::Form, json!({ "fields": [] }));
        form.assets = vec![ToolAsset {
            name: "missing.png".to_string(),
            source_path: fixture.packages.root().join("missing.png"),
        }];

        let err = CollectAssetsStep
            .run(&fixture.ctx(&form), &mut StepOutputs::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_bundle_persist_and_rollback() {
        let fixture = Fixture::new();
        let asset_path = fixture.packages.root().join("logo.svg");
        std::fs::write(&asset_path, b"<svg/>").unwrap();

        let mut form = tool(ToolType::Form, json!({ "fields": [] }));
        form.assets = vec![ToolAsset {
            name: "logo.svg".to_string(),
            source_path: asset_path,
        }];

        let ctx = fixture.ctx(&form);
        let mut outputs = StepOutputs::default();
        CollectAssetsStep.run(&ctx, &mut outputs).await.unwrap();
        BundleArchiveStep.run(&ctx, &mut outputs).await.unwrap();

        let staged = outputs.staged.clone().unwrap();
        assert!(staged.path.exists());

        ComputeChecksumStep.run(&ctx, &mut outputs).await.unwrap();
        assert_eq!(outputs.digest.as_ref().unwrap().size_bytes, staged.size_bytes);

        PersistRecordStep.run(&ctx, &mut outputs).await.unwrap();
        let final_path = outputs.final_path.clone().unwrap();
        assert!(final_path.ends_with("customer-survey-export.tar.gz"));
        assert!(final_path.exists());
        assert!(!fixture.packages.staging_dir(fixture.job.job_id).exists());

        PersistRecordStep.rollback(&ctx, &outputs).await.unwrap();
        BundleArchiveStep.rollback(&ctx, &outputs).await.unwrap();
        assert!(!final_path.exists());
        assert!(!fixture.packages.job_dir(fixture.job.job_id).exists());
    }
}
