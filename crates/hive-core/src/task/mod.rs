//! Task and workflow graph model

mod diagnostic;
mod graph;
mod types;

pub use diagnostic::{Diagnostic, Failure, FailureKind, codes};
pub use graph::WorkflowGraph;
pub use types::{
    AgentTarget, Artifact, ContextEntry, ResultStatus, Task, TaskId, TaskRecord, TaskResult,
    TaskSpec, TaskStatus,
};
