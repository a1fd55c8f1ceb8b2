//! Workflow coordinator
//!
//! Entry point of the orchestration core. Builds the agent hierarchy and the
//! initial graph from a `WorkflowSpec`, then drives scheduler, runtimes and
//! feedback controller until every task has retired.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hive_core::{Config, WorkflowCoordinator, WorkflowOutcome};
//!
//! let coordinator = WorkflowCoordinator::from_config(Config::load()?, models, tools)?;
//! let report = coordinator.run(&spec).await?;
//! if let WorkflowOutcome::Completed(artifacts) = report.outcome {
//!     println!("{:?}", artifacts);
//! }
//! ```

mod run;


use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::info;
use uuid::Uuid;

use crate::Result;
use crate::agents::{AgentHierarchy, AgentId, AgentRuntime, AgentSpec, StrategyRegistry};
use crate::capability::{MemoryStore, ModelRegistry, SqliteMemoryStore, ToolRegistry};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::task::{Artifact, Diagnostic, Failure, TaskId, TaskRecord, TaskStatus, WorkflowGraph};

use run::{Run, RunSettings};

/// A root task of a workflow specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootTask {
    pub payload: JsonValue,
    /// Falls back to `orchestration.default_max_retries`
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl RootTask {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            payload,
            max_retries: None,
        }
    }
}

/// What a workflow run executes: the agent tree and the root tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Agent that owns every root task
    pub root_agent: AgentId,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub tasks: Vec<RootTask>,
}

/// Terminal outcome of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Artifacts of the root tasks, in submission order
    Completed(Vec<Artifact>),
    /// Diagnostic chain of the root task that failed, leaf to root
    Failed(Vec<Diagnostic>),
    Cancelled,
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// What happened during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    /// Every task attempt, in dispatch order
    pub dispatch_order: Vec<TaskId>,
    pub records: Vec<TaskRecord>,
}

impl RunTrace {
    pub fn record(&self, task_id: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.id.as_str() == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: WorkflowOutcome,
    pub trace: RunTrace,
}

impl RunReport {
    fn rejected(run_id: String, failure: Failure) -> Self {
        Self {
            run_id,
            outcome: WorkflowOutcome::Failed(vec![failure.detached()]),
            trace: RunTrace::default(),
        }
    }
}

/// Requests accepted by a running workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Cancel every task; the outcome becomes `Cancelled`
    CancelWorkflow,
    /// Cancel one task and its descendants; its parent re-decides
    CancelTask(TaskId),
}

/// Sending half of a control channel
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl WorkflowHandle {
    /// Returns false when the run is already over
    pub fn cancel(&self) -> bool {
        self.tx.send(Control::CancelWorkflow).is_ok()
    }

    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        self.tx.send(Control::CancelTask(task_id)).is_ok()
    }
}

/// Receiving half of a control channel, consumed by a run
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<Control>,
    open: bool,
}

impl ControlReceiver {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn recv(&mut self) -> Option<Control> {
        let message = self.rx.recv().await;
        if message.is_none() {
            self.open = false;
        }
        message
    }

    /// Messages already queued, without waiting
    fn drain(&mut self) -> Vec<Control> {
        let mut messages = Vec::new();
        while self.open {
            match self.rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.open = false,
            }
        }
        messages
    }
}

/// Create a control channel for `run_controlled` / `resume_controlled`
pub fn control_channel() -> (WorkflowHandle, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkflowHandle { tx }, ControlReceiver { rx, open: true })
}

/// Top-level driver of workflow runs
pub struct WorkflowCoordinator {
    config: Config,
    models: ModelRegistry,
    tools: ToolRegistry,
    strategies: Arc<StrategyRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    checkpoint: Option<Arc<CheckpointStore>>,
}

impl WorkflowCoordinator {
    pub fn new(config: Config, models: ModelRegistry, tools: ToolRegistry) -> Self {
        Self {
            config,
            models,
            tools,
            strategies: Arc::new(StrategyRegistry::default()),
            memory: None,
            checkpoint: None,
        }
    }

    /// Coordinator with the memory and checkpoint stores the config enables
    pub fn from_config(config: Config, models: ModelRegistry, tools: ToolRegistry) -> Result<Self> {
        config.validate()?;
        let memory: Option<Arc<dyn MemoryStore>> = if config.memory.enabled {
            Some(Arc::new(SqliteMemoryStore::new(&config.memory.db_path)?))
        } else {
            None
        };
        let checkpoint = if config.checkpoint.enabled {
            Some(Arc::new(CheckpointStore::new(&config.checkpoint.db_path)?))
        } else {
            None
        };

        let mut coordinator = Self::new(config, models, tools);
        coordinator.memory = memory;
        coordinator.checkpoint = checkpoint;
        Ok(coordinator)
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = Arc::new(strategies);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_checkpoint(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn checkpoint(&self) -> Option<&Arc<CheckpointStore>> {
        self.checkpoint.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `spec` to completion
    pub async fn run(&self, spec: &WorkflowSpec) -> Result<RunReport> {
        let (_handle, control) = control_channel();
        self.run_controlled(spec, control).await
    }

    /// Run `spec`, accepting cancellation requests through `control`.
    ///
    /// Fails with `Error::Config` when the configuration cannot run anything.
    pub async fn run_controlled(
        &self,
        spec: &WorkflowSpec,
        mut control: ControlReceiver,
    ) -> Result<RunReport> {
        self.config.validate()?;
        let run_id = Uuid::now_v7().to_string();
        let runtime = match self.runtime(spec) {
            Ok(runtime) => runtime,
            Err(failure) => return Ok(RunReport::rejected(run_id, failure)),
        };

        let mut graph = WorkflowGraph::new();
        for task in &spec.tasks {
            graph.add_root(
                spec.root_agent.clone(),
                task.payload.clone(),
                task.max_retries
                    .unwrap_or(self.config.orchestration.default_max_retries),
            );
        }

        self.drive(run_id, graph, runtime, &mut control).await
    }

    /// Continue a checkpointed run
    pub async fn resume(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        records: &[TaskRecord],
    ) -> Result<RunReport> {
        let (_handle, control) = control_channel();
        self.resume_controlled(spec, run_id, records, control).await
    }

    /// Continue a checkpointed run under `control`.
    ///
    /// Retired root tasks keep their whole subtree. Unfinished root tasks
    /// restart from scratch with their retry counts and diagnostics; their
    /// descendants are dropped.
    pub async fn resume_controlled(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        records: &[TaskRecord],
        mut control: ControlReceiver,
    ) -> Result<RunReport> {
        self.config.validate()?;
        let run_id = run_id.to_string();
        let runtime = match self.runtime(spec) {
            Ok(runtime) => runtime,
            Err(failure) => return Ok(RunReport::rejected(run_id, failure)),
        };
        let graph = match restore(records) {
            Ok(graph) => graph,
            Err(failure) => return Ok(RunReport::rejected(run_id, failure)),
        };

        info!(
            "Resuming run {} ({} of {} task records kept)",
            run_id,
            graph.len(),
            records.len()
        );
        self.drive(run_id, graph, runtime, &mut control).await
    }

    fn runtime(&self, spec: &WorkflowSpec) -> std::result::Result<Arc<AgentRuntime>, Failure> {
        let hierarchy =
            AgentHierarchy::build(&spec.agents, &self.models, &self.tools, self.memory.clone())?;
        hierarchy.check_root(&spec.root_agent)?;
        Ok(Arc::new(AgentRuntime::new(
            Arc::new(hierarchy),
            self.strategies.clone(),
            self.config.runtime_limits(),
        )))
    }

    async fn drive(
        &self,
        run_id: String,
        graph: WorkflowGraph,
        runtime: Arc<AgentRuntime>,
        control: &mut ControlReceiver,
    ) -> Result<RunReport> {
        let settings = RunSettings {
            limits: self.config.scheduler_limits(),
            default_max_retries: self.config.orchestration.default_max_retries,
            backoff: self.config.retry_backoff(),
        };
        let (mut run, mut events) = Run::new(run_id, graph, runtime, settings);
        run.submit_roots()?;
        run.drive(&mut events, control, self.checkpoint.as_deref())
            .await
    }
}

/// Rebuild the graph to resume from checkpoint records
fn restore(records: &[TaskRecord]) -> std::result::Result<WorkflowGraph, Failure> {
    let checkpointed = WorkflowGraph::from_records(records)?;

    let mut keep = HashSet::new();
    let mut restart = HashSet::new();
    for root in checkpointed.roots() {
        let retired = checkpointed.get(root).is_some_and(|t| t.is_retired());
        if retired {
            keep.extend(checkpointed.subtree(root));
        } else {
            restart.insert(root.clone());
        }
    }

    let kept: Vec<TaskRecord> = records
        .iter()
        .filter_map(|record| {
            if keep.contains(&record.id) {
                Some(record.clone())
            } else if restart.contains(&record.id) {
                Some(TaskRecord {
                    status: TaskStatus::Pending,
                    artifact: None,
                    ..record.clone()
                })
            } else {
                None
            }
        })
        .collect();

    WorkflowGraph::from_records(&kept)
}
