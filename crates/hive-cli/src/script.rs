//! Workflow scripts
//!
//! A script bundles a workflow with scripted models and tools so that a run
//! can be replayed from the command line without any live backend.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Deserialize;

use hive_core::{
    AgentHierarchy, ModelRegistry, ScriptedModel, ScriptedReply, ScriptedTool, ToolRegistry,
    WorkflowSpec,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCapability {
    pub name: String,
    pub replies: Vec<ScriptedReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub workflow: WorkflowSpec,
    #[serde(default)]
    pub models: Vec<ScriptedCapability>,
    #[serde(default)]
    pub tools: Vec<ScriptedCapability>,
}

impl Script {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("スクリプトを読み込めません: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("スクリプトの解析に失敗しました: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let script: Script = toml::from_str(content)?;
        for capability in script.models.iter().chain(&script.tools) {
            if capability.replies.is_empty() {
                bail!("{} has no replies", capability.name);
            }
        }
        Ok(script)
    }

    pub fn models(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        for model in &self.models {
            registry.register(Arc::new(ScriptedModel::new(
                model.name.clone(),
                model.replies.clone(),
            )));
        }
        registry
    }

    pub fn tools(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in &self.tools {
            registry.register(Arc::new(ScriptedTool::new(
                tool.name.clone(),
                tool.replies.clone(),
            )));
        }
        registry
    }

    /// Check the agent tree against the scripted capabilities
    pub fn validate(&self) -> anyhow::Result<()> {
        let hierarchy = AgentHierarchy::build(
            &self.workflow.agents,
            &self.models(),
            &self.tools(),
            None,
        )
        .map_err(|failure| anyhow::anyhow!("{}", failure))?;
        hierarchy
            .check_root(&self.workflow.root_agent)
            .map_err(|failure| anyhow::anyhow!("{}", failure))?;
        if self.workflow.tasks.is_empty() {
            bail!("workflow has no tasks");
        }
        Ok(())
    }
}
