//! Task types
//!
//! - Task: a unit of work owned by exactly one agent
//! - TaskSpec: what a decomposition (or the workflow spec) asks for
//! - TaskResult: the immutable output of one runtime invocation
//! - TaskRecord: the flat, serializable view used by traces and checkpoints

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use super::diagnostic::{Diagnostic, Failure, FailureKind};
use crate::agents::{AgentId, AgentRole};
use crate::{Error, Result};

/// Opaque output of a task
pub type Artifact = JsonValue;

/// Hierarchical task identifier (`t0`, `t0.1`, `t0.1.2`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of the `index`-th root task of a run
    pub fn root(index: usize) -> Self {
        Self(format!("t{}", index))
    }

    /// Identifier of the `n`-th (1-based) child spawned by this task
    pub fn child(&self, n: usize) -> Self {
        Self(format!("{}.{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    AwaitingChildren,
    Succeeded,
    Failed,
    Escalated,
}

impl TaskStatus {
    /// Retired tasks accept no further mutation
    pub fn is_retired(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Escalated)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, InProgress | Escalated | Failed) => true,
            (InProgress, AwaitingChildren | Pending | Succeeded | Failed | Escalated) => true,
            (AwaitingChildren, InProgress) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingChildren => "awaiting_children",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "awaiting_children" => Some(Self::AwaitingChildren),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a child task should be delegated to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTarget {
    /// A specific child agent of the delegating agent
    Agent(AgentId),
    /// The first child agent of the delegating agent with this role
    Role(AgentRole),
}

impl fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{}", id),
            Self::Role(role) => write!(f, "role:{}", role),
        }
    }
}

/// A piece of context handed to a task (memory hit, prior sibling output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub source: String,
    pub content: JsonValue,
}

impl ContextEntry {
    pub fn new(source: impl Into<String>, content: JsonValue) -> Self {
        Self {
            source: source.into(),
            content,
        }
    }
}

/// Specification of a task to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub target: AgentTarget,
    pub payload: JsonValue,
    /// Falls back to the configured default when absent
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub context: Vec<ContextEntry>,
    /// Set when this task takes over the work of an escalated sibling
    #[serde(default)]
    pub replaces: Option<TaskId>,
}

impl TaskSpec {
    pub fn new(target: AgentTarget, payload: JsonValue) -> Self {
        Self {
            target,
            payload,
            max_retries: None,
            context: vec![],
            replaces: None,
        }
    }

    pub fn for_agent(agent: impl Into<String>, payload: JsonValue) -> Self {
        Self::new(AgentTarget::Agent(AgentId::new(agent)), payload)
    }

    pub fn for_role(role: AgentRole, payload: JsonValue) -> Self {
        Self::new(AgentTarget::Role(role), payload)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context(mut self, context: Vec<ContextEntry>) -> Self {
        self.context = context;
        self
    }

    pub fn replacing(mut self, task_id: TaskId) -> Self {
        self.replaces = Some(task_id);
        self
    }
}

/// A unit of work in a workflow graph
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub owner: AgentId,
    pub payload: JsonValue,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Every child ever spawned, in insertion order
    pub children: Vec<TaskId>,
    pub parent: Option<TaskId>,
    /// Parent's retry count when this task was spawned
    pub spawn_attempt: u32,
    pub context: Vec<ContextEntry>,
    pub replaces: Option<TaskId>,
    pub superseded_by: Option<TaskId>,
    pub artifact: Option<Artifact>,
    /// Diagnostics of every failed attempt, oldest first
    pub diagnostics: Vec<Diagnostic>,
}

impl Task {
    pub fn new(id: TaskId, owner: AgentId, payload: JsonValue, max_retries: u32) -> Self {
        Self {
            id,
            owner,
            payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            children: vec![],
            parent: None,
            spawn_attempt: 0,
            context: vec![],
            replaces: None,
            superseded_by: None,
            artifact: None,
            diagnostics: vec![],
        }
    }

    pub fn is_retired(&self) -> bool {
        self.status.is_retired()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            parent_id: self.parent.clone(),
            owner_agent_id: self.owner.clone(),
            status: self.status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            payload: self.payload.clone(),
            artifact: self.artifact.clone(),
            replaces: self.replaces.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

/// Outcome status of one runtime invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Failed,
}

/// Output of executing a task once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    pub artifact: Option<Artifact>,
    /// Child specifications delegated during this invocation
    pub spawned: Vec<TaskSpec>,
    /// Leaf-to-root diagnostics; the last entry belongs to this task
    pub diagnostics: Vec<Diagnostic>,
    pub failure: Option<FailureKind>,
}

impl TaskResult {
    pub fn succeeded(task_id: TaskId, artifact: Artifact, spawned: Vec<TaskSpec>) -> Self {
        Self {
            task_id,
            status: ResultStatus::Succeeded,
            artifact: Some(artifact),
            spawned,
            diagnostics: vec![],
            failure: None,
        }
    }

    /// Failed result whose own diagnostic follows any inherited ones
    pub fn failed(
        task_id: TaskId,
        agent_id: &AgentId,
        attempt: u32,
        failure: Failure,
        inherited: Vec<Diagnostic>,
        spawned: Vec<TaskSpec>,
    ) -> Self {
        let kind = failure.kind;
        let mut diagnostics = inherited;
        diagnostics.push(failure.at(&task_id, agent_id, attempt));
        Self {
            task_id,
            status: ResultStatus::Failed,
            artifact: None,
            spawned,
            diagnostics,
            failure: Some(kind),
        }
    }

    pub fn cancelled(task_id: TaskId, agent_id: &AgentId, attempt: u32) -> Self {
        Self::failed(task_id, agent_id, attempt, Failure::cancelled(), vec![], vec![])
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Succeeded
    }

    pub fn is_cancellation(&self) -> bool {
        self.failure == Some(FailureKind::Cancellation)
    }

    /// The diagnostic describing this task's own failure
    pub fn own_diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostics.last()
    }
}

/// Flat per-task record for traces and checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub owner_agent_id: AgentId,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub payload: JsonValue,
    pub artifact: Option<Artifact>,
    pub replaces: Option<TaskId>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}
