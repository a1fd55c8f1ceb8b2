//! Feedback and retry controller
//!
//! The one place where task status and retry counts change after a runtime
//! reports. Classification is a pure function of the task and its result;
//! `apply` performs the matching transition on the graph.

use std::fmt;

use tracing::{debug, warn};

use crate::Result;
use crate::task::{Failure, FailureKind, Task, TaskResult, TaskStatus, WorkflowGraph, codes};

/// Verdict on one task result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Succeeded with every effective child succeeded
    Accept,
    /// Transient failure with retry budget left: resubmit to the same agent
    Retry,
    /// Unrecoverable here: hand the failure to the parent's owner
    Escalate,
    /// Unrecoverable at a root task, or cancelled
    Fail,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accept => "accept",
            Self::Retry => "retry",
            Self::Escalate => "escalate",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FeedbackController;

impl FeedbackController {
    pub fn new() -> Self {
        Self
    }

    /// Classify `result` for `task`.
    ///
    /// `children_succeeded` tells whether every effective child of the task
    /// succeeded; a success report is only accepted when it holds.
    pub fn classify(task: &Task, result: &TaskResult, children_succeeded: bool) -> Classification {
        if result.is_success() && children_succeeded {
            return Classification::Accept;
        }

        let kind = if result.is_success() {
            FailureKind::Structural
        } else {
            result.failure.unwrap_or(FailureKind::Structural)
        };

        match kind {
            FailureKind::Cancellation => Classification::Fail,
            FailureKind::Transient if task.retry_count < task.max_retries => Classification::Retry,
            _ if task.parent.is_some() => Classification::Escalate,
            _ => Classification::Fail,
        }
    }

    /// Classify `result` and apply the transition to its task
    pub fn apply(&self, graph: &mut WorkflowGraph, result: TaskResult) -> Result<Classification> {
        let children_succeeded = graph.children_succeeded(&result.task_id);
        let task = graph.task_mut(&result.task_id)?;
        let classification = Self::classify(task, &result, children_succeeded);
        let reported_success = result.is_success();

        match classification {
            Classification::Accept => {
                task.transition(TaskStatus::Succeeded)?;
                task.artifact = result.artifact;
            }
            Classification::Retry => {
                task.transition(TaskStatus::Pending)?;
                task.retry_count += 1;
                task.diagnostics.extend(result.diagnostics);
                warn!(
                    "Retrying task {} on {} ({}/{})",
                    task.id, task.owner, task.retry_count, task.max_retries
                );
            }
            Classification::Escalate | Classification::Fail => {
                let next = if classification == Classification::Escalate {
                    TaskStatus::Escalated
                } else {
                    TaskStatus::Failed
                };
                task.transition(next)?;
                task.diagnostics.extend(result.diagnostics);
                if reported_success {
                    let diag = Failure::structural(
                        codes::UNRESOLVED_CHILDREN,
                        "reported success while children did not succeed",
                    )
                    .at(&task.id, &task.owner, task.retry_count);
                    task.diagnostics.push(diag);
                }
                warn!("Task {} {}: {}", task.id, next, last_code(task));
            }
        }

        debug!("Classified task {} as {}", task.id, classification);
        Ok(classification)
    }
}

fn last_code(task: &Task) -> &str {
    task.diagnostics
        .last()
        .map(|d| d.code.as_str())
        .unwrap_or("unknown")
}
