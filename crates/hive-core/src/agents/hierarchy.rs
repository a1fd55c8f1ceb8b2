//! Agent hierarchy
//!
//! Builds the agent tree from specs, resolves capabilities through the
//! registries, and answers delegation questions: which child agent takes a
//! target, and which sibling can substitute for one that failed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use super::types::{Agent, AgentId, AgentRole, AgentSpec};
use crate::capability::{MemoryStore, ModelRegistry, ToolRegistry, ToolSet};
use crate::task::{AgentTarget, Failure, codes};

/// Validated tree of agents
#[derive(Debug)]
pub struct AgentHierarchy {
    agents: HashMap<AgentId, Agent>,
    /// Specification order
    order: Vec<AgentId>,
}

impl AgentHierarchy {
    /// Build and validate a hierarchy.
    ///
    /// Fails with a structural failure on duplicate ids, dangling parent
    /// references, cycles, or capabilities missing from the registries.
    pub fn build(
        specs: &[AgentSpec],
        models: &ModelRegistry,
        tools: &ToolRegistry,
        memory: Option<Arc<dyn MemoryStore>>,
    ) -> Result<Self, Failure> {
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(&spec.id) {
                return Err(Failure::structural(
                    codes::DUPLICATE_AGENT,
                    format!("agent {} is defined more than once", spec.id),
                ));
            }
        }

        let parents: HashMap<&AgentId, Option<&AgentId>> =
            specs.iter().map(|s| (&s.id, s.parent.as_ref())).collect();

        for spec in specs {
            if let Some(parent) = &spec.parent {
                if !parents.contains_key(parent) {
                    return Err(Failure::structural(
                        codes::NO_SUCH_AGENT,
                        format!("agent {} names missing parent {}", spec.id, parent),
                    ));
                }
            }

            let mut visited = HashSet::new();
            let mut current = Some(&spec.id);
            while let Some(id) = current {
                if !visited.insert(id) {
                    return Err(Failure::structural(
                        codes::CYCLE_DETECTED,
                        format!("agent {} is its own ancestor", spec.id),
                    ));
                }
                current = parents.get(id).copied().flatten();
            }
        }

        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for spec in specs {
            let model = models.get(&spec.model).ok_or_else(|| {
                Failure::structural(
                    codes::NO_SUCH_MODEL,
                    format!("agent {} uses unknown model {}", spec.id, spec.model),
                )
            })?;

            let mut tool_set = Vec::with_capacity(spec.tools.len());
            for name in &spec.tools {
                let tool = tools.get(name).ok_or_else(|| {
                    Failure::structural(
                        codes::NO_SUCH_TOOL,
                        format!("agent {} uses unknown tool {}", spec.id, name),
                    )
                })?;
                tool_set.push(tool);
            }

            if spec.memory && memory.is_none() {
                warn!("Agent {} requests memory but no store is configured", spec.id);
            }

            let children = specs
                .iter()
                .filter(|s| s.parent.as_ref() == Some(&spec.id))
                .map(|s| s.id.clone())
                .collect();

            agents.insert(
                spec.id.clone(),
                Agent {
                    id: spec.id.clone(),
                    role: spec.role.clone(),
                    model,
                    tools: ToolSet::new(tool_set),
                    memory: if spec.memory { memory.clone() } else { None },
                    children,
                    parent: spec.parent.clone(),
                },
            );
            order.push(spec.id.clone());
        }

        info!("Built agent hierarchy with {} agents", agents.len());
        Ok(Self { agents, order })
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Agent ids in specification order
    pub fn ids(&self) -> &[AgentId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Check that `root` can own root tasks: it must exist and have no parent
    pub fn check_root(&self, root: &AgentId) -> Result<(), Failure> {
        match self.agents.get(root) {
            None => Err(Failure::structural(
                codes::INVALID_ROOT,
                format!("root agent {} does not exist", root),
            )),
            Some(agent) if agent.parent.is_some() => Err(Failure::structural(
                codes::INVALID_ROOT,
                format!("root agent {} has a parent", root),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Resolve a delegation target among the children of `delegator`
    pub fn resolve(&self, delegator: &AgentId, target: &AgentTarget) -> Option<AgentId> {
        let agent = self.agents.get(delegator)?;
        match target {
            AgentTarget::Agent(id) => agent.children.iter().find(|c| *c == id).cloned(),
            AgentTarget::Role(role) => self.child_with_role(agent, role, &[]),
        }
    }

    /// A child of `delegator` with `role` that is not in `exclude`
    pub fn substitute(
        &self,
        delegator: &AgentId,
        role: &AgentRole,
        exclude: &[AgentId],
    ) -> Option<AgentId> {
        let agent = self.agents.get(delegator)?;
        self.child_with_role(agent, role, exclude)
    }

    fn child_with_role(
        &self,
        agent: &Agent,
        role: &AgentRole,
        exclude: &[AgentId],
    ) -> Option<AgentId> {
        agent
            .children
            .iter()
            .filter(|id| !exclude.contains(id))
            .find(|id| self.agents.get(*id).is_some_and(|c| &c.role == role))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ScriptedModel, ScriptedTool, SqliteMemoryStore};
    use serde_json::json;

    fn registries() -> (ModelRegistry, ToolRegistry) {
        let models = ModelRegistry::new()
            .with(Arc::new(ScriptedModel::always("planner", json!(null))))
            .with(Arc::new(ScriptedModel::always("coder", json!(null))));
        let tools =
            ToolRegistry::new().with(Arc::new(ScriptedTool::always("write_file", json!("ok"))));
        (models, tools)
    }

    fn team() -> Vec<AgentSpec> {
        vec![
            AgentSpec::new("a", AgentRole::Planner, "planner"),
            AgentSpec::new("b", AgentRole::Engineer, "coder").child_of("a"),
            AgentSpec::new("c", AgentRole::Engineer, "coder")
                .child_of("a")
                .with_tools(vec!["write_file"]),
            AgentSpec::new("q", AgentRole::Qa, "coder").child_of("a"),
            AgentSpec::new("m", AgentRole::Micro, "coder").child_of("b"),
        ]
    }

    #[test]
    fn test_build_links_children_in_order() {
        let (models, tools) = registries();
        let hierarchy = AgentHierarchy::build(&team(), &models, &tools, None).unwrap();

        assert_eq!(hierarchy.len(), 5);
        let root = hierarchy.get(&AgentId::new("a")).unwrap();
        assert_eq!(
            root.children,
            vec![AgentId::new("b"), AgentId::new("c"), AgentId::new("q")]
        );
        assert_eq!(hierarchy.get(&AgentId::new("c")).unwrap().tools.len(), 1);
        assert!(hierarchy.check_root(&AgentId::new("a")).is_ok());
        assert_eq!(
            hierarchy.check_root(&AgentId::new("b")).unwrap_err().code,
            codes::INVALID_ROOT
        );
        assert_eq!(
            hierarchy.check_root(&AgentId::new("ghost")).unwrap_err().code,
            codes::INVALID_ROOT
        );
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let (models, tools) = registries();
        let mut specs = team();
        specs.push(AgentSpec::new("b", AgentRole::Engineer, "coder"));
        let err = AgentHierarchy::build(&specs, &models, &tools, None).unwrap_err();
        assert_eq!(err.code, codes::DUPLICATE_AGENT);
    }

    #[test]
    fn test_build_rejects_cycles() {
        let (models, tools) = registries();
        let specs = vec![
            AgentSpec::new("x", AgentRole::Planner, "planner").child_of("y"),
            AgentSpec::new("y", AgentRole::Planner, "planner").child_of("x"),
        ];
        let err = AgentHierarchy::build(&specs, &models, &tools, None).unwrap_err();
        assert_eq!(err.code, codes::CYCLE_DETECTED);
    }

    #[test]
    fn test_build_rejects_dangling_parent_and_unknown_capabilities() {
        let (models, tools) = registries();

        let specs = vec![AgentSpec::new("x", AgentRole::Planner, "planner").child_of("ghost")];
        let err = AgentHierarchy::build(&specs, &models, &tools, None).unwrap_err();
        assert_eq!(err.code, codes::NO_SUCH_AGENT);

        let specs = vec![AgentSpec::new("x", AgentRole::Planner, "gpt")];
        let err = AgentHierarchy::build(&specs, &models, &tools, None).unwrap_err();
        assert_eq!(err.code, codes::NO_SUCH_MODEL);

        let specs =
            vec![AgentSpec::new("x", AgentRole::Planner, "planner").with_tools(vec!["deploy"])];
        let err = AgentHierarchy::build(&specs, &models, &tools, None).unwrap_err();
        assert_eq!(err.code, codes::NO_SUCH_TOOL);
    }

    #[test]
    fn test_memory_only_for_agents_that_ask() {
        let (models, tools) = registries();
        let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::in_memory().unwrap());
        let specs = vec![
            AgentSpec::new("a", AgentRole::Planner, "planner").with_memory(),
            AgentSpec::new("b", AgentRole::Engineer, "coder").child_of("a"),
        ];
        let hierarchy = AgentHierarchy::build(&specs, &models, &tools, Some(memory)).unwrap();

        assert!(hierarchy.get(&AgentId::new("a")).unwrap().memory.is_some());
        assert!(hierarchy.get(&AgentId::new("b")).unwrap().memory.is_none());
    }

    #[test]
    fn test_resolve_only_among_children() {
        let (models, tools) = registries();
        let hierarchy = AgentHierarchy::build(&team(), &models, &tools, None).unwrap();
        let a = AgentId::new("a");

        let by_id = AgentTarget::Agent(AgentId::new("c"));
        assert_eq!(hierarchy.resolve(&a, &by_id), Some(AgentId::new("c")));

        // m exists but belongs to b
        let grandchild = AgentTarget::Agent(AgentId::new("m"));
        assert_eq!(hierarchy.resolve(&a, &grandchild), None);

        let by_role = AgentTarget::Role(AgentRole::Engineer);
        assert_eq!(hierarchy.resolve(&a, &by_role), Some(AgentId::new("b")));

        let missing_role = AgentTarget::Role(AgentRole::Micro);
        assert_eq!(hierarchy.resolve(&a, &missing_role), None);
    }

    #[test]
    fn test_substitute_skips_tried_agents() {
        let (models, tools) = registries();
        let hierarchy = AgentHierarchy::build(&team(), &models, &tools, None).unwrap();
        let a = AgentId::new("a");

        let next = hierarchy.substitute(&a, &AgentRole::Engineer, &[AgentId::new("b")]);
        assert_eq!(next, Some(AgentId::new("c")));

        let none = hierarchy.substitute(
            &a,
            &AgentRole::Engineer,
            &[AgentId::new("b"), AgentId::new("c")],
        );
        assert_eq!(none, None);
    }
}
