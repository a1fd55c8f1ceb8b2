//! Failure taxonomy and diagnostics
//!
//! Failures are values. A `Failure` is what a phase of the runtime produces,
//! a `Diagnostic` is the same failure pinned to a task, agent and attempt so
//! the final outcome can show where in the tree things went wrong.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::TaskId;
use crate::agents::AgentId;

/// Diagnostic codes carried by failed results
pub mod codes {
    pub const EMPTY_DECOMPOSITION: &str = "empty-decomposition";
    pub const NO_SUCH_AGENT: &str = "no-such-agent";
    pub const NO_SUCH_MODEL: &str = "no-such-model";
    pub const NO_SUCH_TOOL: &str = "no-such-tool";
    pub const DUPLICATE_AGENT: &str = "duplicate-agent";
    pub const INVALID_ROOT: &str = "invalid-root";
    pub const CYCLE_DETECTED: &str = "cycle-detected";
    pub const DANGLING_PARENT: &str = "dangling-parent";
    pub const CANCELLED: &str = "cancelled";
    pub const MODEL_FAILURE: &str = "model-failure";
    pub const TOOL_FAILURE: &str = "tool-failure";
    pub const MALFORMED_DECISION: &str = "malformed-decision";
    pub const VALIDATION_FAILED: &str = "validation-failed";
    pub const CHILDREN_ESCALATED: &str = "children-escalated";
    pub const UNRESOLVED_CHILDREN: &str = "unresolved-children";
    pub const RUNTIME_PANIC: &str = "runtime-panic";
}

/// Failure classes driving the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A model or tool returned a failure; eligible for retry
    Transient,
    /// The work cannot succeed as specified; never retried
    Structural,
    /// An ancestor (or the workflow) was cancelled; never retried
    Cancellation,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Structural => "structural",
            Self::Cancellation => "cancellation",
        }
    }
}

/// A failure produced by one of the runtime phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn structural(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Structural,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancellation,
            code: codes::CANCELLED.to_string(),
            message: "execution cancelled".to_string(),
        }
    }

    /// Pin this failure to a task attempt
    pub fn at(self, task_id: &TaskId, agent_id: &AgentId, attempt: u32) -> Diagnostic {
        Diagnostic {
            task_id: Some(task_id.clone()),
            agent_id: Some(agent_id.clone()),
            attempt,
            kind: self.kind,
            code: self.code,
            message: self.message,
        }
    }

    /// Diagnostic not tied to any task (e.g. hierarchy validation)
    pub fn detached(self) -> Diagnostic {
        Diagnostic {
            task_id: None,
            agent_id: None,
            attempt: 0,
            kind: self.kind,
            code: self.code,
            message: self.message,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A failure located in the task tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
    /// Retry count of the task when the failure happened (0 = first attempt)
    pub attempt: u32,
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.task_id, &self.agent_id) {
            (Some(task), Some(agent)) => write!(
                f,
                "[{} @ {} attempt {}] {}: {}",
                task, agent, self.attempt, self.code, self.message
            ),
            (Some(task), None) => write!(f, "[{}] {}: {}", task, self.code, self.message),
            _ => write!(f, "{}: {}", self.code, self.message),
        }
    }
}
