//! Tool definitions as provided by the tool registry.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Kind of tool; selects the export step plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Form,
    Workflow,
    Theme,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Form => "form",
            ToolType::Workflow => "workflow",
            ToolType::Theme => "theme",
        }
    }

    /// Top-level configuration key every tool of this type must carry.
    pub fn required_config_key(&self) -> &'static str {
        match self {
            ToolType::Form => "fields",
            ToolType::Workflow => "nodes",
            ToolType::Theme => "palette",
        }
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "form" | "forms" => Ok(ToolType::Form),
            "workflow" | "workflows" => Ok(ToolType::Workflow),
            "theme" | "themes" => Ok(ToolType::Theme),
            _ => Err(format!("Unknown tool type: {}", s)),
        }
    }
}

/// A file shipped inside the export package under `assets/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ToolAsset {
    #[validate(custom(function = "shared::validation::validate_asset_name"))]
    pub name: String,

    /// Where the asset bytes live on the registry's storage.
    pub source_path: PathBuf,
}

/// A configured tool as returned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub id: Uuid,

    #[validate(
        length(min = 1, max = 255, message = "Name must be 1-255 characters"),
        custom(function = "shared::validation::validate_not_blank")
    )]
    pub name: String,

    pub tool_type: ToolType,

    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,

    /// Builder output for the tool (form fields, workflow nodes, theme palette...).
    pub config: serde_json::Value,

    #[validate(nested)]
    #[serde(default)]
    pub assets: Vec<ToolAsset>,

    /// Other tools a workflow references.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
}
