//! Tool registry — the shim between the turn pipeline and external tool
//! implementations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use strand_domain::tool::{Tool, ToolDefinition};

/// Registered tools, looked up by name during the turn loop.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Same-name registration replaces.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        tracing::debug!(tool = %name, "tool registered");
        self.tools.write().insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Definitions for the provider request, name-sorted for stable prompts.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// A registry restricted to the named tools (for sub-agents).
    pub fn restricted(&self, allowed: &[String]) -> ToolRegistry {
        let tools = self.tools.read();
        let filtered: HashMap<String, Arc<dyn Tool>> = tools
            .iter()
            .filter(|(name, _)| allowed.iter().any(|a| a == *name))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        ToolRegistry {
            tools: RwLock::new(filtered),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_domain::error::Result;
    use strand_domain::tool::{ToolContext, ToolOutcome};

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "Echo".into(),
                description: "echoes its input".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(
            &self,
            arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome> {
            Ok(ToolOutcome {
                content: arguments.to_string(),
                is_error: false,
                details: None,
            })
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.get("Echo").is_some());
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn restricted_filters_tools() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let none = registry.restricted(&[]);
        assert!(none.is_empty());
        let some = registry.restricted(&["Echo".to_string()]);
        assert_eq!(some.names(), vec!["Echo"]);
    }
}
