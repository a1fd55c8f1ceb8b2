//! Capability interfaces
//!
//! Contracts for the collaborators the orchestration core calls but does not
//! implement: models, tools and the shared memory store. Every call returns
//! an explicit failure value; the runtime turns those into failed task
//! results instead of letting them cross its boundary.

mod memory;
mod model;
mod scripted;
mod tool;

use thiserror::Error;

pub use memory::{MemoryEntry, MemoryStore, SqliteMemoryStore};
pub use model::{Model, ModelRegistry};
pub use scripted::{ScriptedModel, ScriptedReply, ScriptedTool};
pub use tool::{Tool, ToolAction, ToolRegistry, ToolSet};

/// Failure reported by a capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CapabilityError(String);

impl CapabilityError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}
