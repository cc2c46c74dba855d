//! Postgres-backed tool registry.

use domain::models::{ToolAsset, ToolDefinition, ToolType};
use domain::services::{RepositoryError, ToolRegistry};
use sqlx::PgPool;
use std::path::PathBuf;
use uuid::Uuid;

use crate::entities::{ToolAssetEntity, ToolEntity};
use crate::metrics::QueryTimer;

/// [`ToolRegistry`] over the `tools` and `tool_assets` tables.
#[derive(Clone)]
pub struct PgToolRegistry {
    pool: PgPool,
}

impl PgToolRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ToolRegistry for PgToolRegistry {
    async fn get_tool(&self, tool_id: Uuid) -> Result<Option<ToolDefinition>, RepositoryError> {
        let timer = QueryTimer::new("tools.find_by_id");
        let entity = sqlx::query_as::<_, ToolEntity>(
            r#"
            SELECT id, name, tool_type, description, config, dependencies
            FROM tools
            WHERE id = $1
            "#,
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await;
        timer.record();

        let Some(entity) = entity.map_err(backend)? else {
            return Ok(None);
        };

        let timer = QueryTimer::new("tool_assets.list_for_tool");
        let assets = sqlx::query_as::<_, ToolAssetEntity>(
            r#"
            SELECT tool_id, name, source_path
            FROM tool_assets
            WHERE tool_id = $1
            ORDER BY position ASC, name ASC
            "#,
        )
        .bind(tool_id)
        .fetch_all(&self.pool)
        .await;
        timer.record();

        entity_to_domain(entity, assets.map_err(backend)?).map(Some)
    }

    async fn tool_ids_by_type(&self, tool_type: ToolType) -> Result<Vec<Uuid>, RepositoryError> {
        let timer = QueryTimer::new("tools.ids_by_type");
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM tools WHERE tool_type = $1")
            .bind(tool_type.as_str())
            .fetch_all(&self.pool)
            .await;
        timer.record();

        ids.map_err(backend)
    }
}

fn backend(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(err.to_string())
}

fn entity_to_domain(
    entity: ToolEntity,
    assets: Vec<ToolAssetEntity>,
) -> Result<ToolDefinition, RepositoryError> {
    let tool_type = entity
        .tool_type
        .parse::<ToolType>()
        .map_err(RepositoryError::Backend)?;

    Ok(ToolDefinition {
        id: entity.id,
        name: entity.name,
        tool_type,
        description: entity.description,
        config: entity.config,
        assets: assets
            .into_iter()
            .map(|asset| ToolAsset {
                name: asset.name,
                source_path: PathBuf::from(asset.source_path),
            })
            .collect(),
        dependencies: entity.dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_to_domain_with_assets() {
        let id = Uuid::new_v4();
        let tool = entity_to_domain(
            ToolEntity {
                id,
                name: "Signup".to_string(),
                tool_type: "form".to_string(),
                description: None,
                config: serde_json::json!({ "fields": [] }),
                dependencies: vec![],
            },
            vec![ToolAssetEntity {
                tool_id: id,
                name: "logo.svg".to_string(),
                source_path: "/srv/assets/logo.svg".to_string(),
            }],
        )
        .unwrap();

        assert_eq!(tool.tool_type, ToolType::Form);
        assert_eq!(tool.assets.len(), 1);
        assert_eq!(tool.assets[0].source_path, PathBuf::from("/srv/assets/logo.svg"));
    }

    #[test]
    fn test_entity_to_domain_rejects_unknown_type() {
        let result = entity_to_domain(
            ToolEntity {
                id: Uuid::new_v4(),
                name: "Mystery".to_string(),
                tool_type: "gadget".to_string(),
                description: None,
                config: serde_json::Value::Null,
                dependencies: vec![],
            },
            vec![],
        );
        assert!(result.is_err());
    }
}
