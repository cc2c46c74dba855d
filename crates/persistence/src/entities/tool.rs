//! Tool catalog entities.

use sqlx::FromRow;
use uuid::Uuid;

/// Database row for `tools`.
#[derive(Debug, Clone, FromRow)]
pub struct ToolEntity {
    pub id: Uuid,
    pub name: String,
    pub tool_type: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub dependencies: Vec<Uuid>,
}

/// Database row for `tool_assets`.
#[derive(Debug, Clone, FromRow)]
pub struct ToolAssetEntity {
    pub tool_id: Uuid,
    pub name: String,
    pub source_path: String,
}
