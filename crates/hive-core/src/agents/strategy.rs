//! Decide strategies
//!
//! Implements:
//! - DecideStrategy: role-specific decision logic plugged into the runtime
//! - ModelPlanStrategy: asks the agent's model for a direct answer or a plan
//! - ValidationStrategy: asks the model for a pass/fail verdict
//! - StrategyRegistry: maps roles to strategies

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::hierarchy::AgentHierarchy;
use super::types::{Agent, AgentId, AgentRole};
use crate::capability::{MemoryEntry, ToolAction};
use crate::task::{
    AgentTarget, Artifact, ContextEntry, Diagnostic, Failure, Task, TaskId, TaskSpec, TaskStatus,
    codes,
};

/// What the Perceive phase gathered for one task attempt
#[derive(Debug, Clone, Default)]
pub struct Perception {
    pub payload: JsonValue,
    /// Recalled memories, best match first
    pub memories: Vec<MemoryEntry>,
    /// Context attached to the task by its delegator
    pub context: Vec<ContextEntry>,
}

impl Perception {
    /// Memories and task context as one ordered list for a model call
    pub fn context_entries(&self) -> Vec<ContextEntry> {
        self.memories
            .iter()
            .map(|m| ContextEntry::new(format!("memory:{}", m.key), m.data.clone()))
            .chain(self.context.iter().cloned())
            .collect()
    }
}

/// Inputs available to a strategy
pub struct DecideContext<'a> {
    pub task_id: &'a TaskId,
    /// Retry count of the task (0 = first attempt)
    pub attempt: u32,
    pub agent: &'a Agent,
    pub hierarchy: &'a AgentHierarchy,
    pub perception: &'a Perception,
}

/// How an agent handles its task
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Produce the artifact directly, after running tool actions in order
    Direct {
        artifact: Artifact,
        actions: Vec<ToolAction>,
    },
    /// Delegate subtasks to child agents
    Decompose {
        children: Vec<TaskSpec>,
        /// Run children one at a time, each seeing prior siblings' outputs
        sequential: bool,
    },
}

impl Decision {
    pub fn direct(artifact: Artifact) -> Self {
        Self::Direct {
            artifact,
            actions: vec![],
        }
    }

    pub fn decompose(children: Vec<TaskSpec>) -> Self {
        Self::Decompose {
            children,
            sequential: false,
        }
    }
}

/// Resolved child as seen by its parent after a join
#[derive(Debug, Clone, PartialEq)]
pub struct ChildReport {
    pub task_id: TaskId,
    pub owner: AgentId,
    pub status: TaskStatus,
    pub artifact: Option<Artifact>,
    /// Leaf-to-root diagnostics of every failed attempt
    pub diagnostics: Vec<Diagnostic>,
    pub payload: JsonValue,
    pub max_retries: u32,
    pub context: Vec<ContextEntry>,
    /// Agents that already held this slot, oldest first
    pub tried: Vec<AgentId>,
}

impl ChildReport {
    pub fn from_task(task: &Task, tried: Vec<AgentId>) -> Self {
        Self {
            task_id: task.id.clone(),
            owner: task.owner.clone(),
            status: task.status,
            artifact: task.artifact.clone(),
            diagnostics: task.diagnostics.clone(),
            payload: task.payload.clone(),
            max_retries: task.max_retries,
            context: task.context.clone(),
            tried,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    fn was_cancelled(&self) -> bool {
        self.diagnostics.last().is_some_and(|d| d.is(codes::CANCELLED))
    }
}

/// What to do about failed children
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Run these specs; a spec with `replaces` takes over that slot
    Reassign(Vec<TaskSpec>),
    /// Stop and fail the parent
    GiveUp(String),
}

/// Role-specific decision logic
#[async_trait]
pub trait DecideStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Decide how to handle the task
    async fn decide(&self, ctx: &DecideContext<'_>) -> Result<Decision, Failure>;

    /// Called when children of a decomposition did not succeed
    async fn recover(
        &self,
        ctx: &DecideContext<'_>,
        failed: &[ChildReport],
    ) -> Result<Recovery, Failure> {
        Ok(substitute_failed(ctx, failed))
    }

    /// Combine child artifacts, in slot order, into this task's artifact
    fn synthesize(&self, _ctx: &DecideContext<'_>, children: &[ChildReport]) -> Artifact {
        collect_artifacts(children)
    }
}

/// Hand each failed slot to a sibling agent of the same role that has not
/// held it yet. Gives up when any slot has no candidate left.
pub fn substitute_failed(ctx: &DecideContext<'_>, failed: &[ChildReport]) -> Recovery {
    let mut specs = Vec::with_capacity(failed.len());
    for report in failed {
        if report.was_cancelled() {
            return Recovery::GiveUp(format!("{} was cancelled", report.task_id));
        }
        let Some(role) = ctx.hierarchy.get(&report.owner).map(|a| a.role.clone()) else {
            return Recovery::GiveUp(format!(
                "{} was assigned to unknown agent {}",
                report.task_id, report.owner
            ));
        };
        match ctx.hierarchy.substitute(&ctx.agent.id, &role, &report.tried) {
            Some(agent) => specs.push(
                TaskSpec::new(AgentTarget::Agent(agent), report.payload.clone())
                    .with_max_retries(report.max_retries)
                    .with_context(report.context.clone())
                    .replacing(report.task_id.clone()),
            ),
            None => {
                return Recovery::GiveUp(format!(
                    "no other {} agent can take over {}",
                    role, report.task_id
                ));
            }
        }
    }
    Recovery::Reassign(specs)
}

/// Child artifacts as a JSON array in slot order
pub fn collect_artifacts(children: &[ChildReport]) -> Artifact {
    JsonValue::Array(
        children
            .iter()
            .map(|c| c.artifact.clone().unwrap_or(JsonValue::Null))
            .collect(),
    )
}

/// Payload as prompt text
pub fn payload_text(payload: &JsonValue) -> String {
    match payload {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Prompt describing the task, the agent and what it can delegate to
pub fn render_prompt(ctx: &DecideContext<'_>) -> String {
    let mut prompt = format!(
        "You are agent {} ({}).\nTask {} (attempt {}):\n{}\n",
        ctx.agent.id,
        ctx.agent.role,
        ctx.task_id,
        ctx.attempt,
        payload_text(&ctx.perception.payload)
    );

    if !ctx.agent.children.is_empty() {
        let children: Vec<String> = ctx
            .agent
            .children
            .iter()
            .filter_map(|id| ctx.hierarchy.get(id))
            .map(|c| format!("{} ({})", c.id, c.role))
            .collect();
        prompt.push_str(&format!("You may delegate to: {}\n", children.join(", ")));
    }

    if !ctx.agent.tools.is_empty() {
        prompt.push_str(&format!("Tools: {}\n", ctx.agent.tools.names().join(", ")));
    }

    prompt
}

async fn invoke_model(ctx: &DecideContext<'_>) -> Result<JsonValue, Failure> {
    let prompt = render_prompt(ctx);
    let context = ctx.perception.context_entries();
    ctx.agent
        .model
        .invoke(&prompt, &context)
        .await
        .map_err(|e| {
            Failure::transient(
                codes::MODEL_FAILURE,
                format!("model {}: {}", ctx.agent.model.name(), e),
            )
        })
}

#[derive(Debug, Deserialize)]
struct PlannedSubtask {
    #[serde(default)]
    agent: Option<AgentId>,
    #[serde(default)]
    role: Option<AgentRole>,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl PlannedSubtask {
    fn into_spec(self) -> Result<TaskSpec, Failure> {
        let target = match (self.agent, self.role) {
            (Some(agent), _) => AgentTarget::Agent(agent),
            (None, Some(role)) => AgentTarget::Role(role),
            (None, None) => {
                return Err(Failure::transient(
                    codes::MALFORMED_DECISION,
                    "subtask names neither an agent nor a role",
                ));
            }
        };
        let mut spec = TaskSpec::new(target, self.payload);
        spec.max_retries = self.max_retries;
        Ok(spec)
    }
}

#[derive(Debug, Deserialize)]
struct Plan {
    subtasks: Vec<PlannedSubtask>,
    #[serde(default)]
    sequential: bool,
}

#[derive(Debug, Deserialize)]
struct DirectReply {
    artifact: JsonValue,
    #[serde(default)]
    actions: Vec<ToolAction>,
}

fn empty_decomposition(message: &str) -> Failure {
    Failure::structural(codes::EMPTY_DECOMPOSITION, message)
}

fn malformed(err: impl std::fmt::Display) -> Failure {
    Failure::transient(codes::MALFORMED_DECISION, err.to_string())
}

/// Interpret a model reply as a decision.
///
/// - `{"subtasks": [...], "sequential": bool}` decomposes
/// - `{"artifact": ..., "actions": [...]}` answers directly after tool calls
/// - any other non-empty value is the artifact itself
pub fn parse_decision(reply: JsonValue) -> Result<Decision, Failure> {
    if reply.is_null() || reply.as_object().is_some_and(|m| m.is_empty()) {
        return Err(empty_decomposition("model returned no decision"));
    }

    if reply.get("subtasks").is_some() {
        let plan: Plan = serde_json::from_value(reply).map_err(malformed)?;
        if plan.subtasks.is_empty() {
            return Err(empty_decomposition("plan contains no subtasks"));
        }
        let children = plan
            .subtasks
            .into_iter()
            .map(PlannedSubtask::into_spec)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Decision::Decompose {
            children,
            sequential: plan.sequential,
        });
    }

    if reply.get("artifact").is_some() {
        let direct: DirectReply = serde_json::from_value(reply).map_err(malformed)?;
        if direct.artifact.is_null() {
            return Err(empty_decomposition("reply carries a null artifact"));
        }
        return Ok(Decision::Direct {
            artifact: direct.artifact,
            actions: direct.actions,
        });
    }

    Ok(Decision::direct(reply))
}

/// Default strategy: the model either answers or returns a plan
#[derive(Debug, Default)]
pub struct ModelPlanStrategy;

#[async_trait]
impl DecideStrategy for ModelPlanStrategy {
    fn name(&self) -> &str {
        "model-plan"
    }

    async fn decide(&self, ctx: &DecideContext<'_>) -> Result<Decision, Failure> {
        let reply = invoke_model(ctx).await?;
        parse_decision(reply)
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    verdict: String,
    #[serde(default)]
    reason: String,
}

/// QA strategy: the model's verdict decides whether the task passes.
///
/// A failing verdict is transient, so the retry policy gives the check
/// another attempt.
#[derive(Debug, Default)]
pub struct ValidationStrategy;

#[async_trait]
impl DecideStrategy for ValidationStrategy {
    fn name(&self) -> &str {
        "validation"
    }

    async fn decide(&self, ctx: &DecideContext<'_>) -> Result<Decision, Failure> {
        let reply = invoke_model(ctx).await?;
        let verdict: Verdict = serde_json::from_value(reply.clone()).map_err(malformed)?;

        match verdict.verdict.to_lowercase().as_str() {
            "pass" => Ok(Decision::direct(reply)),
            "fail" => {
                let reason = if verdict.reason.is_empty() {
                    "validation failed".to_string()
                } else {
                    verdict.reason
                };
                Err(Failure::transient(codes::VALIDATION_FAILED, reason))
            }
            other => Err(malformed(format!("unknown verdict {}", other))),
        }
    }
}

/// Strategy lookup by role
pub struct StrategyRegistry {
    strategies: HashMap<AgentRole, Arc<dyn DecideStrategy>>,
    fallback: Arc<dyn DecideStrategy>,
}

impl StrategyRegistry {
    /// Registry with `fallback` for every role
    pub fn new(fallback: Arc<dyn DecideStrategy>) -> Self {
        Self {
            strategies: HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, role: AgentRole, strategy: Arc<dyn DecideStrategy>) {
        self.strategies.insert(role, strategy);
    }

    pub fn with(mut self, role: AgentRole, strategy: Arc<dyn DecideStrategy>) -> Self {
        self.register(role, strategy);
        self
    }

    pub fn for_role(&self, role: &AgentRole) -> Arc<dyn DecideStrategy> {
        self.strategies
            .get(role)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ModelPlanStrategy)).with(AgentRole::Qa, Arc::new(ValidationStrategy))
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roles: HashMap<&str, &str> = self
            .strategies
            .iter()
            .map(|(role, s)| (role.as_str(), s.name()))
            .collect();
        f.debug_struct("StrategyRegistry")
            .field("roles", &roles)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentSpec;
    use crate::capability::{ModelRegistry, ScriptedModel, ToolRegistry};
    use serde_json::json;

    fn hierarchy() -> AgentHierarchy {
        let models = ModelRegistry::new().with(Arc::new(ScriptedModel::always("m", json!(null))));
        let specs = vec![
            AgentSpec::new("a", AgentRole::Planner, "m"),
            AgentSpec::new("b", AgentRole::Engineer, "m").child_of("a"),
            AgentSpec::new("c", AgentRole::Engineer, "m").child_of("a"),
        ];
        AgentHierarchy::build(&specs, &models, &ToolRegistry::new(), None).unwrap()
    }

    fn failed_child(id: &str, owner: &str, tried: Vec<&str>) -> ChildReport {
        let mut task = Task::new(TaskId::new(id), AgentId::new(owner), json!("work"), 1);
        task.status = TaskStatus::Escalated;
        task.diagnostics = vec![
            Failure::transient(codes::MODEL_FAILURE, "down").at(&task.id, &task.owner, 1),
        ];
        ChildReport::from_task(&task, tried.into_iter().map(AgentId::new).collect())
    }

    #[test]
    fn test_parse_plan() {
        let decision = parse_decision(json!({
            "subtasks": [
                {"agent": "b", "payload": "part 1"},
                {"role": "qa", "payload": "check", "max_retries": 0}
            ],
            "sequential": true
        }))
        .unwrap();

        let Decision::Decompose { children, sequential } = decision else {
            panic!("expected a decomposition");
        };
        assert!(sequential);
        assert_eq!(children[0].target, AgentTarget::Agent(AgentId::new("b")));
        assert_eq!(children[1].target, AgentTarget::Role(AgentRole::Qa));
        assert_eq!(children[1].max_retries, Some(0));
    }

    #[test]
    fn test_parse_direct_with_actions() {
        let decision = parse_decision(json!({
            "artifact": "patched",
            "actions": [{"tool": "fs", "action": "write", "args": {"path": "a.rs"}}]
        }))
        .unwrap();

        let Decision::Direct { artifact, actions } = decision else {
            panic!("expected a direct decision");
        };
        assert_eq!(artifact, json!("patched"));
        assert_eq!(actions, vec![ToolAction::new("fs", "write", json!({"path": "a.rs"}))]);
    }

    #[test]
    fn test_parse_plain_value_is_artifact() {
        assert_eq!(parse_decision(json!("done")).unwrap(), Decision::direct(json!("done")));
        assert_eq!(parse_decision(json!([1, 2])).unwrap(), Decision::direct(json!([1, 2])));
    }

    #[test]
    fn test_parse_empty_is_structural() {
        for reply in [json!(null), json!({}), json!({"subtasks": []}), json!({"artifact": null})] {
            let err = parse_decision(reply).unwrap_err();
            assert_eq!(err.code, codes::EMPTY_DECOMPOSITION);
            assert!(!err.kind.is_retryable());
        }
    }

    #[test]
    fn test_parse_malformed_is_transient() {
        let err = parse_decision(json!({"subtasks": "not a list"})).unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_DECISION);
        assert!(err.kind.is_retryable());

        let err = parse_decision(json!({"subtasks": [{"payload": "who?"}]})).unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_DECISION);
    }

    #[test]
    fn test_substitute_failed_picks_untried_sibling() {
        let hierarchy = hierarchy();
        let agent = hierarchy.get(&AgentId::new("a")).unwrap();
        let perception = Perception::default();
        let task_id = TaskId::root(0);
        let ctx = DecideContext {
            task_id: &task_id,
            attempt: 0,
            agent,
            hierarchy: &hierarchy,
            perception: &perception,
        };

        let recovery = substitute_failed(&ctx, &[failed_child("t0.2", "b", vec!["b"])]);
        let Recovery::Reassign(specs) = recovery else {
            panic!("expected a reassignment");
        };
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].target, AgentTarget::Agent(AgentId::new("c")));
        assert_eq!(specs[0].replaces, Some(TaskId::new("t0.2")));
        assert_eq!(specs[0].payload, json!("work"));
        assert_eq!(specs[0].max_retries, Some(1));

        let recovery = substitute_failed(&ctx, &[failed_child("t0.3", "c", vec!["b", "c"])]);
        assert!(matches!(recovery, Recovery::GiveUp(_)));
    }

    #[test]
    fn test_collect_artifacts_in_slot_order() {
        let mut first = Task::new(TaskId::new("t0.1"), AgentId::new("b"), json!(1), 0);
        first.status = TaskStatus::Succeeded;
        first.artifact = Some(json!("one"));
        let mut second = first.clone();
        second.id = TaskId::new("t0.2");
        second.artifact = Some(json!("two"));

        let reports = vec![
            ChildReport::from_task(&first, vec![]),
            ChildReport::from_task(&second, vec![]),
        ];
        assert_eq!(collect_artifacts(&reports), json!(["one", "two"]));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.for_role(&AgentRole::Qa).name(), "validation");
        assert_eq!(registry.for_role(&AgentRole::Planner).name(), "model-plan");
        assert_eq!(
            registry.for_role(&AgentRole::Custom("reviewer".into())).name(),
            "model-plan"
        );
    }

    #[test]
    fn test_perception_context_entries() {
        let perception = Perception {
            payload: json!("x"),
            memories: vec![MemoryEntry {
                key: "task:t0".into(),
                data: json!("earlier"),
                created_at: chrono::Utc::now(),
            }],
            context: vec![ContextEntry::new("sibling:t0.1", json!("one"))],
        };
        let sources: Vec<_> = perception
            .context_entries()
            .into_iter()
            .map(|e| e.source)
            .collect();
        assert_eq!(sources, vec!["memory:task:t0", "sibling:t0.1"]);
    }
}
