//! Read-only view of the tool catalog.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::job_store::RepositoryError;
use crate::models::{ToolDefinition, ToolType};

/// Tool catalog lookups needed by exports. Catalog CRUD lives elsewhere.
#[async_trait::async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn get_tool(&self, tool_id: Uuid) -> Result<Option<ToolDefinition>, RepositoryError>;

    async fn tool_ids_by_type(&self, tool_type: ToolType) -> Result<Vec<Uuid>, RepositoryError>;
}

/// Registry backed by a map, for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryToolRegistry {
    tools: RwLock<HashMap<Uuid, ToolDefinition>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tool.
    pub fn upsert(&self, tool: ToolDefinition) {
        if let Ok(mut tools) = self.tools.write() {
            tools.insert(tool.id, tool);
        }
    }

    pub fn remove(&self, tool_id: Uuid) -> Option<ToolDefinition> {
        self.tools.write().ok().and_then(|mut tools| tools.remove(&tool_id))
    }
}

#[async_trait::async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn get_tool(&self, tool_id: Uuid) -> Result<Option<ToolDefinition>, RepositoryError> {
        let tools = self
            .tools
            .read()
            .map_err(|_| RepositoryError::Backend("tool registry lock poisoned".into()))?;
        Ok(tools.get(&tool_id).cloned())
    }

    async fn tool_ids_by_type(&self, tool_type: ToolType) -> Result<Vec<Uuid>, RepositoryError> {
        let tools = self
            .tools
            .read()
            .map_err(|_| RepositoryError::Backend("tool registry lock poisoned".into()))?;
        Ok(tools
            .values()
            .filter(|tool| tool.tool_type == tool_type)
            .map(|tool| tool.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(tool_type: ToolType) -> ToolDefinition {
        ToolDefinition {
            id: Uuid::new_v4(),
            name: format!("{} tool", tool_type),
            tool_type,
            description: None,
            config: serde_json::json!({}),
            assets: vec![],
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn test_get_tool() {
        let registry = InMemoryToolRegistry::new();
        let form = tool(ToolType::Form);
        registry.upsert(form.clone());

        assert_eq!(registry.get_tool(form.id).await.unwrap(), Some(form));
        assert_eq!(registry.get_tool(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tool_ids_by_type() {
        let registry = InMemoryToolRegistry::new();
        let form = tool(ToolType::Form);
        let theme = tool(ToolType::Theme);
        registry.upsert(form.clone());
        registry.upsert(theme.clone());

        assert_eq!(registry.tool_ids_by_type(ToolType::Form).await.unwrap(), vec![form.id]);
        assert!(registry
            .tool_ids_by_type(ToolType::Workflow)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = InMemoryToolRegistry::new();
        let form = tool(ToolType::Form);
        registry.upsert(form.clone());
        assert!(registry.remove(form.id).is_some());
        assert_eq!(registry.get_tool(form.id).await.unwrap(), None);
    }
}
