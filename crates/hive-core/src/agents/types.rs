//! Agent types
//!
//! One agent record type parameterized by a role tag. Role-specific
//! behavior lives in the decide strategy, not in agent subtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::capability::{MemoryStore, Model, ToolSet};

/// Unique identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Role tag of an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentRole {
    Planner,
    Engineer,
    Micro,
    Qa,
    Custom(String),
}

impl AgentRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Planner => "planner",
            Self::Engineer => "engineer",
            Self::Micro => "micro",
            Self::Qa => "qa",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for AgentRole {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "planner" => Self::Planner,
            "engineer" => Self::Engineer,
            "micro" => Self::Micro,
            "qa" => Self::Qa,
            _ => Self::Custom(value),
        }
    }
}

impl From<AgentRole> for String {
    fn from(role: AgentRole) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative agent definition, as found in a workflow specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub role: AgentRole,
    /// Name of a model in the model registry
    pub model: String,
    /// Names of tools in the tool registry, in order
    #[serde(default)]
    pub tools: Vec<String>,
    /// Whether the agent reads and writes the shared memory store
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub parent: Option<AgentId>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, role: AgentRole, model: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(id),
            role,
            model: model.into(),
            tools: vec![],
            memory: false,
            parent: None,
        }
    }

    pub fn child_of(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(AgentId::new(parent));
        self
    }

    pub fn with_tools(mut self, tools: Vec<&str>) -> Self {
        self.tools = tools.into_iter().map(String::from).collect();
        self
    }

    pub fn with_memory(mut self) -> Self {
        self.memory = true;
        self
    }
}

/// A node of the agent hierarchy with its resolved capabilities
pub struct Agent {
    pub id: AgentId,
    pub role: AgentRole,
    pub model: Arc<dyn Model>,
    pub tools: ToolSet,
    pub memory: Option<Arc<dyn MemoryStore>>,
    /// Children in specification order
    pub children: Vec<AgentId>,
    pub parent: Option<AgentId>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("model", &self.model.name())
            .field("tools", &self.tools)
            .field("memory", &self.memory.is_some())
            .field("children", &self.children)
            .field("parent", &self.parent)
            .finish()
    }
}
