//! hive-core: Hierarchical Agent Orchestration Core
//!
//! エージェント階層上でのタスク分解、委譲、リトライ、検証、集約を行う
//! オーケストレーションのコア機能を提供します。
//! モデル・ツール・メモリは capability インターフェース越しに利用します。

pub mod agents;
pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod feedback;
pub mod scheduler;
pub mod task;

pub use agents::{
    AgentHierarchy, AgentId, AgentRole, AgentRuntime, AgentSpec, DecideStrategy, Decision,
    StrategyRegistry,
};
pub use capability::{
    CapabilityError, MemoryStore, Model, ModelRegistry, ScriptedModel, ScriptedReply,
    ScriptedTool, SqliteMemoryStore, Tool, ToolRegistry,
};
pub use checkpoint::{CheckpointStore, RunSummary};
pub use config::{CheckpointConfig, Config, MemoryConfig, OrchestrationConfig};
pub use coordinator::{
    Control, ControlReceiver, RootTask, RunReport, RunTrace, WorkflowCoordinator,
    WorkflowHandle, WorkflowOutcome, WorkflowSpec, control_channel,
};
pub use error::{Error, Result};
pub use feedback::{Classification, FeedbackController};
pub use scheduler::{DelegationScheduler, SchedulerLimits, Slot};
pub use task::{
    Artifact, Diagnostic, Failure, FailureKind, Task, TaskId, TaskRecord, TaskResult, TaskSpec,
    TaskStatus, WorkflowGraph,
};
