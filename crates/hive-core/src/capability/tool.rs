//! Tool capability
//!
//! Tools realize a direct artifact (write a file, run a test, ...). They are
//! stateless from the core's point of view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::CapabilityError;

/// Tool trait for side-effecting actions requested by a decision
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name (used in decisions and agent specs)
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str {
        ""
    }

    /// Perform `action` with `args`
    async fn invoke(
        &self,
        action: &str,
        args: &JsonValue,
    ) -> std::result::Result<JsonValue, CapabilityError>;
}

/// One tool call requested by a Decide phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAction {
    pub tool: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub args: JsonValue,
}

impl ToolAction {
    pub fn new(tool: impl Into<String>, action: impl Into<String>, args: JsonValue) -> Self {
        Self {
            tool: tool.into(),
            action: action.into(),
            args,
        }
    }
}

/// Registry of every tool a coordinator can hand out
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool
    ///
    /// If a tool with the same name already exists, it will be replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Ordered tools granted to one agent
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ScriptedTool;
    use serde_json::json;

    #[test]
    fn test_tool_set_keeps_order() {
        let set = ToolSet::new(vec![
            Arc::new(ScriptedTool::always("write_file", json!("ok"))),
            Arc::new(ScriptedTool::always("run_tests", json!("ok"))),
        ]);

        assert_eq!(set.names(), vec!["write_file", "run_tests"]);
        assert!(set.get("run_tests").is_some());
        assert!(set.get("deploy").is_none());
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::always("shell", json!(1))));
        registry.register(Arc::new(ScriptedTool::always("shell", json!(2))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tool_action_defaults() {
        let action: ToolAction = serde_json::from_value(json!({"tool": "run_tests"})).unwrap();
        assert_eq!(action.tool, "run_tests");
        assert!(action.action.is_empty());
        assert!(action.args.is_null());
    }
}
