//! Agent runtime
//!
//! Executes one task for one agent through four phases:
//! 1. Perceive: payload, recalled memories and delegator context
//! 2. Decide: the role's strategy picks a direct answer or a decomposition
//! 3. Act: run tool actions, or delegate children and wait for the join
//! 4. Report: build the result and remember successful work
//!
//! No failure crosses this boundary as an error: every outcome, including
//! cancellation, comes back as a `TaskResult`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hierarchy::AgentHierarchy;
use super::strategy::{
    ChildReport, DecideContext, DecideStrategy, Decision, Perception, Recovery, StrategyRegistry,
    payload_text,
};
use super::types::{Agent, AgentId};
use crate::capability::ToolAction;
use crate::task::{
    Artifact, ContextEntry, Diagnostic, Failure, TaskId, TaskResult, TaskSpec, codes,
};

/// One invocation request
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: TaskId,
    pub payload: JsonValue,
    pub context: Vec<ContextEntry>,
    /// Retry count of the task (0 = first attempt)
    pub attempt: u32,
}

/// What a suspended runtime receives when its children resolve
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// Every child retired; reports follow the order of the submitted specs
    Resolved(Vec<ChildReport>),
    /// The waiting task was cancelled
    Cancelled,
}

/// Hands child specs to the scheduler and suspends until they resolve
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(&self, children: Vec<TaskSpec>) -> JoinOutcome;
}

/// Per-invocation limits
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    /// Recovery rounds per invocation before the task gives up on its children
    pub max_replans: u32,
    /// Memories handed to the Decide phase
    pub memory_recall_limit: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_replans: 2,
            memory_recall_limit: 5,
        }
    }
}

struct ActFailure {
    failure: Failure,
    inherited: Vec<Diagnostic>,
}

impl From<Failure> for ActFailure {
    fn from(failure: Failure) -> Self {
        Self {
            failure,
            inherited: vec![],
        }
    }
}

struct Scope<'a> {
    strategy: &'a dyn DecideStrategy,
    delegator: &'a dyn Delegator,
    cancel: &'a CancellationToken,
}

/// Runs tasks for any agent of a hierarchy
pub struct AgentRuntime {
    hierarchy: Arc<AgentHierarchy>,
    strategies: Arc<StrategyRegistry>,
    limits: RuntimeLimits,
}

impl AgentRuntime {
    pub fn new(
        hierarchy: Arc<AgentHierarchy>,
        strategies: Arc<StrategyRegistry>,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            hierarchy,
            strategies,
            limits,
        }
    }

    pub fn hierarchy(&self) -> &Arc<AgentHierarchy> {
        &self.hierarchy
    }

    /// Execute one attempt of a task for `agent_id`
    pub async fn execute(
        &self,
        agent_id: &AgentId,
        job: Job,
        delegator: &dyn Delegator,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let Some(agent) = self.hierarchy.get(agent_id) else {
            return TaskResult::failed(
                job.task_id,
                agent_id,
                job.attempt,
                Failure::structural(
                    codes::NO_SUCH_AGENT,
                    format!("agent {} does not exist", agent_id),
                ),
                vec![],
                vec![],
            );
        };
        let strategy = self.strategies.for_role(&agent.role);

        if cancel.is_cancelled() {
            return TaskResult::cancelled(job.task_id, &agent.id, job.attempt);
        }
        debug!(task = %job.task_id, agent = %agent.id, attempt = job.attempt, "Perceive");
        let perception = self.perceive(agent, &job).await;

        if cancel.is_cancelled() {
            return TaskResult::cancelled(job.task_id, &agent.id, job.attempt);
        }
        let ctx = DecideContext {
            task_id: &job.task_id,
            attempt: job.attempt,
            agent,
            hierarchy: &self.hierarchy,
            perception: &perception,
        };
        let decided = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Failure::cancelled()),
            decided = strategy.decide(&ctx) => decided,
        };
        let decision = match decided {
            Ok(decision) => decision,
            Err(failure) => {
                debug!(task = %job.task_id, "Decide failed: {}", failure);
                return TaskResult::failed(
                    job.task_id.clone(),
                    &agent.id,
                    job.attempt,
                    failure,
                    vec![],
                    vec![],
                );
            }
        };

        let scope = Scope {
            strategy: strategy.as_ref(),
            delegator,
            cancel,
        };
        let mut spawned = Vec::new();
        let acted = match decision {
            Decision::Direct { artifact, actions } => self
                .act_direct(agent, artifact, actions, cancel)
                .await
                .map_err(ActFailure::from),
            Decision::Decompose {
                children,
                sequential,
            } => {
                self.act_decompose(&ctx, &scope, children, sequential, &mut spawned)
                    .await
            }
        };

        match acted {
            Ok(_) if cancel.is_cancelled() => TaskResult::failed(
                job.task_id.clone(),
                &agent.id,
                job.attempt,
                Failure::cancelled(),
                vec![],
                spawned,
            ),
            Ok(artifact) => {
                self.report(agent, &job, &artifact).await;
                TaskResult::succeeded(job.task_id.clone(), artifact, spawned)
            }
            Err(ActFailure { failure, inherited }) => TaskResult::failed(
                job.task_id.clone(),
                &agent.id,
                job.attempt,
                failure,
                inherited,
                spawned,
            ),
        }
    }

    async fn perceive(&self, agent: &Agent, job: &Job) -> Perception {
        let mut memories = Vec::new();
        if let Some(memory) = &agent.memory {
            let query = payload_text(&job.payload);
            match memory.retrieve(&query).await {
                Ok(mut entries) => {
                    entries.truncate(self.limits.memory_recall_limit);
                    memories = entries;
                }
                Err(e) => warn!("Memory recall failed for task {}: {}", job.task_id, e),
            }
        }

        Perception {
            payload: job.payload.clone(),
            memories,
            context: job.context.clone(),
        }
    }

    async fn act_direct(
        &self,
        agent: &Agent,
        artifact: Artifact,
        actions: Vec<ToolAction>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, Failure> {
        if actions.is_empty() {
            return Ok(artifact);
        }

        let mut outputs = Vec::with_capacity(actions.len());
        for action in actions {
            let tool = agent.tools.get(&action.tool).ok_or_else(|| {
                Failure::structural(
                    codes::NO_SUCH_TOOL,
                    format!("agent {} has no tool {}", agent.id, action.tool),
                )
            })?;

            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Failure::cancelled()),
                invoked = tool.invoke(&action.action, &action.args) => invoked,
            };
            let output = invoked.map_err(|e| {
                Failure::transient(
                    codes::TOOL_FAILURE,
                    format!("{} {}: {}", action.tool, action.action, e),
                )
            })?;

            outputs.push(json!({
                "tool": action.tool,
                "action": action.action,
                "output": output,
            }));
        }

        Ok(json!({ "artifact": artifact, "actions": outputs }))
    }

    async fn act_decompose(
        &self,
        ctx: &DecideContext<'_>,
        scope: &Scope<'_>,
        children: Vec<TaskSpec>,
        sequential: bool,
        spawned: &mut Vec<TaskSpec>,
    ) -> Result<Artifact, ActFailure> {
        if children.is_empty() {
            return Err(Failure::structural(
                codes::EMPTY_DECOMPOSITION,
                "decomposition produced no subtasks",
            )
            .into());
        }

        let batches: Vec<Vec<TaskSpec>> = if sequential {
            children.into_iter().map(|c| vec![c]).collect()
        } else {
            vec![children]
        };

        let mut slots: Vec<ChildReport> = Vec::new();
        let mut replans = 0;
        for mut batch in batches {
            if sequential {
                let siblings: Vec<ContextEntry> = slots
                    .iter()
                    .filter_map(|s| {
                        s.artifact
                            .as_ref()
                            .map(|a| ContextEntry::new(format!("sibling:{}", s.task_id), a.clone()))
                    })
                    .collect();
                for spec in &mut batch {
                    spec.context.extend(siblings.iter().cloned());
                }
            }

            let mut reports = self.join(scope, batch, spawned).await?;
            loop {
                let failed: Vec<ChildReport> =
                    reports.iter().filter(|r| !r.is_success()).cloned().collect();
                if failed.is_empty() {
                    break;
                }
                if replans >= self.limits.max_replans {
                    return Err(children_escalated(&failed, "recovery limit reached"));
                }
                replans += 1;

                if scope.cancel.is_cancelled() {
                    return Err(Failure::cancelled().into());
                }
                let recovery = scope
                    .strategy
                    .recover(ctx, &failed)
                    .await
                    .map_err(|failure| ActFailure {
                        failure,
                        inherited: chains(&failed),
                    })?;
                let specs = match recovery {
                    Recovery::Reassign(specs) if !specs.is_empty() => specs,
                    Recovery::Reassign(_) => {
                        return Err(children_escalated(&failed, "no recovery proposed"));
                    }
                    Recovery::GiveUp(reason) => return Err(children_escalated(&failed, &reason)),
                };

                info!(
                    "Task {} reassigns {} failed children (round {})",
                    ctx.task_id,
                    specs.len(),
                    replans
                );
                let targets: Vec<Option<TaskId>> =
                    specs.iter().map(|s| s.replaces.clone()).collect();
                let replacements = self.join(scope, specs, spawned).await?;
                for (replaced, report) in targets.into_iter().zip(replacements) {
                    match replaced.and_then(|id| reports.iter().position(|r| r.task_id == id)) {
                        Some(pos) => reports[pos] = report,
                        None => reports.push(report),
                    }
                }
            }
            slots.extend(reports);
        }

        Ok(scope.strategy.synthesize(ctx, &slots))
    }

    async fn join(
        &self,
        scope: &Scope<'_>,
        specs: Vec<TaskSpec>,
        spawned: &mut Vec<TaskSpec>,
    ) -> Result<Vec<ChildReport>, ActFailure> {
        if scope.cancel.is_cancelled() {
            return Err(Failure::cancelled().into());
        }
        spawned.extend(specs.iter().cloned());
        match scope.delegator.delegate(specs).await {
            JoinOutcome::Resolved(reports) => Ok(reports),
            JoinOutcome::Cancelled => Err(Failure::cancelled().into()),
        }
    }

    async fn report(&self, agent: &Agent, job: &Job, artifact: &Artifact) {
        let Some(memory) = &agent.memory else {
            return;
        };
        let key = format!("task:{}", job.task_id);
        let data = json!({
            "task": job.task_id,
            "agent": agent.id,
            "payload": job.payload,
            "artifact": artifact,
        });
        if let Err(e) = memory.store(&key, data).await {
            warn!("Failed to remember task {}: {}", job.task_id, e);
        }
    }
}

fn chains(failed: &[ChildReport]) -> Vec<Diagnostic> {
    failed
        .iter()
        .flat_map(|r| r.diagnostics.iter().cloned())
        .collect()
}

fn children_escalated(failed: &[ChildReport], reason: &str) -> ActFailure {
    let ids: Vec<String> = failed.iter().map(|r| r.task_id.to_string()).collect();
    ActFailure {
        failure: Failure::structural(
            codes::CHILDREN_ESCALATED,
            format!("children {} did not succeed: {}", ids.join(", "), reason),
        ),
        inherited: chains(failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRole, AgentSpec};
    use crate::capability::{
        MemoryStore, ModelRegistry, ScriptedModel, ScriptedReply, ScriptedTool, SqliteMemoryStore,
        ToolRegistry,
    };
    use crate::task::{AgentTarget, FailureKind, ResultStatus, Task, TaskStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolves every delegated spec immediately through `resolve`
    struct StubDelegator<F> {
        resolve: F,
        next: AtomicUsize,
        calls: Mutex<Vec<Vec<TaskSpec>>>,
        tried: Mutex<HashMap<TaskId, Vec<AgentId>>>,
    }

    impl<F> StubDelegator<F>
    where
        F: Fn(&TaskSpec) -> (TaskStatus, Option<Artifact>) + Send + Sync,
    {
        fn new(resolve: F) -> Self {
            Self {
                resolve,
                next: AtomicUsize::new(1),
                calls: Mutex::new(vec![]),
                tried: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<TaskSpec>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F> Delegator for StubDelegator<F>
    where
        F: Fn(&TaskSpec) -> (TaskStatus, Option<Artifact>) + Send + Sync,
    {
        async fn delegate(&self, children: Vec<TaskSpec>) -> JoinOutcome {
            self.calls.lock().unwrap().push(children.clone());
            let reports = children
                .iter()
                .map(|spec| {
                    let n = self.next.fetch_add(1, Ordering::SeqCst);
                    let owner = match &spec.target {
                        AgentTarget::Agent(id) => id.clone(),
                        AgentTarget::Role(role) => AgentId::new(format!("role:{}", role)),
                    };
                    let mut task = Task::new(
                        TaskId::root(0).child(n),
                        owner.clone(),
                        spec.payload.clone(),
                        0,
                    );
                    let (status, artifact) = (self.resolve)(spec);
                    task.status = status;
                    task.artifact = artifact;
                    task.context = spec.context.clone();
                    if status != TaskStatus::Succeeded {
                        task.diagnostics = vec![
                            Failure::transient(codes::MODEL_FAILURE, "broken")
                                .at(&task.id, &owner, 0),
                        ];
                    }

                    let mut tried_map = self.tried.lock().unwrap();
                    let mut tried = spec
                        .replaces
                        .as_ref()
                        .and_then(|r| tried_map.get(r).cloned())
                        .unwrap_or_default();
                    tried.push(owner);
                    tried_map.insert(task.id.clone(), tried.clone());
                    ChildReport::from_task(&task, tried)
                })
                .collect();
            JoinOutcome::Resolved(reports)
        }
    }

    struct CancelledDelegator;

    #[async_trait]
    impl Delegator for CancelledDelegator {
        async fn delegate(&self, _children: Vec<TaskSpec>) -> JoinOutcome {
            JoinOutcome::Cancelled
        }
    }

    fn runtime_with(
        planner: Vec<ScriptedReply>,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> AgentRuntime {
        let models = ModelRegistry::new()
            .with(Arc::new(ScriptedModel::new("planner", planner)))
            .with(Arc::new(ScriptedModel::always("coder", json!("code"))));
        let tools = ToolRegistry::new()
            .with(Arc::new(ScriptedTool::always("fs", json!("written"))))
            .with(Arc::new(ScriptedTool::new(
                "ci",
                vec![ScriptedReply::Fail("runner offline".into())],
            )));
        let mut lead =
            AgentSpec::new("a", AgentRole::Planner, "planner").with_tools(vec!["fs", "ci"]);
        lead.memory = memory.is_some();
        let specs = vec![
            lead,
            AgentSpec::new("b", AgentRole::Engineer, "coder").child_of("a"),
            AgentSpec::new("c", AgentRole::Engineer, "coder").child_of("a"),
        ];
        let hierarchy = AgentHierarchy::build(&specs, &models, &tools, memory).unwrap();
        AgentRuntime::new(
            Arc::new(hierarchy),
            Arc::new(StrategyRegistry::default()),
            RuntimeLimits::default(),
        )
    }

    fn job(payload: JsonValue) -> Job {
        Job {
            task_id: TaskId::root(0),
            payload,
            context: vec![],
            attempt: 0,
        }
    }

    fn never_called()
    -> StubDelegator<impl Fn(&TaskSpec) -> (TaskStatus, Option<Artifact>) + Send + Sync> {
        StubDelegator::new(|_: &TaskSpec| -> (TaskStatus, Option<Artifact>) {
            panic!("no delegation expected")
        })
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let runtime = runtime_with(vec![ScriptedReply::Ok(json!("hello"))], None);
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("greet")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.artifact, Some(json!("hello")));
        assert!(result.spawned.is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_is_transient() {
        let runtime = runtime_with(vec![ScriptedReply::Fail("rate limited".into())], None);
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("x")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::Transient));
        assert!(result.own_diagnostic().unwrap().is(codes::MODEL_FAILURE));
    }

    #[tokio::test]
    async fn test_tool_actions_run_in_order() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "artifact": "patched",
                "actions": [{"tool": "fs", "action": "write", "args": {"path": "lib.rs"}}]
            }))],
            None,
        );
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("patch")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact["artifact"], json!("patched"));
        assert_eq!(artifact["actions"][0]["output"], json!("written"));
    }

    #[tokio::test]
    async fn test_tool_failures() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "artifact": "x",
                "actions": [{"tool": "ci", "action": "run"}]
            }))],
            None,
        );
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("x")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.failure, Some(FailureKind::Transient));
        assert!(result.own_diagnostic().unwrap().is(codes::TOOL_FAILURE));

        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "artifact": "x",
                "actions": [{"tool": "deploy", "action": "prod"}]
            }))],
            None,
        );
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("x")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.failure, Some(FailureKind::Structural));
        assert!(result.own_diagnostic().unwrap().is(codes::NO_SUCH_TOOL));
    }

    #[tokio::test]
    async fn test_decompose_synthesizes_in_slot_order() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "subtasks": [{"agent": "b", "payload": "one"}, {"agent": "c", "payload": "two"}]
            }))],
            None,
        );
        let delegator = StubDelegator::new(|spec: &TaskSpec| {
            (TaskStatus::Succeeded, Some(json!(format!("did {}", spec.payload.as_str().unwrap()))))
        });
        let result = runtime
            .execute(&AgentId::new("a"), job(json!("build")), &delegator, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.artifact, Some(json!(["did one", "did two"])));
        assert_eq!(result.spawned.len(), 2);
        assert_eq!(delegator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_child_is_reassigned_to_sibling() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "subtasks": [{"agent": "b", "payload": "one"}, {"agent": "b", "payload": "two"}]
            }))],
            None,
        );
        // b fails "two"; c succeeds at anything
        let delegator = StubDelegator::new(|spec: &TaskSpec| {
            match (&spec.target, spec.payload.as_str()) {
                (AgentTarget::Agent(id), Some("two")) if id.as_str() == "b" => {
                    (TaskStatus::Escalated, None)
                }
                _ => (TaskStatus::Succeeded, Some(spec.payload.clone())),
            }
        });
        let result = runtime
            .execute(&AgentId::new("a"), job(json!("build")), &delegator, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.artifact, Some(json!(["one", "two"])));

        let calls = delegator.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][0].target, AgentTarget::Agent(AgentId::new("c")));
        assert_eq!(calls[1][0].replaces, Some(TaskId::new("t0.2")));
        assert_eq!(result.spawned.len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_leaf_to_root_chain() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({"subtasks": [{"agent": "b", "payload": "x"}]}))],
            None,
        );
        let delegator = StubDelegator::new(|_: &TaskSpec| (TaskStatus::Escalated, None));
        let result = runtime
            .execute(&AgentId::new("a"), job(json!("build")), &delegator, &CancellationToken::new())
            .await;

        assert_eq!(result.failure, Some(FailureKind::Structural));
        // b failed, c failed, then no engineer left
        assert_eq!(delegator.calls().len(), 2);
        let codes_seen: Vec<_> = result.diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes_seen, vec![codes::MODEL_FAILURE, codes::CHILDREN_ESCALATED]);
        assert_eq!(
            result.diagnostics.last().unwrap().task_id,
            Some(TaskId::root(0))
        );
    }

    #[tokio::test]
    async fn test_sequential_children_see_prior_outputs() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({
                "subtasks": [
                    {"agent": "b", "payload": "design"},
                    {"agent": "c", "payload": "build"}
                ],
                "sequential": true
            }))],
            None,
        );
        let delegator = StubDelegator::new(|spec: &TaskSpec| {
            (TaskStatus::Succeeded, Some(json!(spec.context.len())))
        });
        let result = runtime
            .execute(&AgentId::new("a"), job(json!("ship")), &delegator, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        let calls = delegator.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][0].context.is_empty());
        assert_eq!(calls[1][0].context[0].source, "sibling:t0.1");
        assert_eq!(result.artifact, Some(json!([0, 1])));
    }

    #[tokio::test]
    async fn test_cancelled_join() {
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!({"subtasks": [{"agent": "b", "payload": "x"}]}))],
            None,
        );
        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("x")),
                &CancelledDelegator,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.failure, Some(FailureKind::Cancellation));
        assert_eq!(result.spawned.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let runtime = runtime_with(vec![ScriptedReply::Ok(json!("x"))], None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runtime
            .execute(&AgentId::new("a"), job(json!("x")), &never_called(), &cancel)
            .await;

        assert_eq!(result.failure, Some(FailureKind::Cancellation));
        assert!(result.own_diagnostic().unwrap().is(codes::CANCELLED));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let runtime = runtime_with(vec![ScriptedReply::Ok(json!("x"))], None);
        let result = runtime
            .execute(
                &AgentId::new("ghost"),
                job(json!("x")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.own_diagnostic().unwrap().is(codes::NO_SUCH_AGENT));
    }

    #[tokio::test]
    async fn test_report_remembers_and_perceive_recalls() {
        let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::in_memory().unwrap());
        let runtime = runtime_with(
            vec![ScriptedReply::Ok(json!("parsed ok"))],
            Some(memory.clone()),
        );

        let result = runtime
            .execute(
                &AgentId::new("a"),
                job(json!("parser")),
                &never_called(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_success());

        let entries = memory.retrieve("parser").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "task:t0");

        let agent = runtime.hierarchy().get(&AgentId::new("a")).unwrap();
        let perception = runtime.perceive(agent, &job(json!("parser"))).await;
        assert_eq!(perception.memories.len(), 1);
    }
}
