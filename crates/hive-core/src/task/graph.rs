//! Workflow graph
//!
//! A forest of tasks linked by decomposition (parent -> children). There are
//! no arbitrary dependency edges: a task's children must all resolve before
//! the task itself resolves.

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;

use super::codes;
use super::diagnostic::Failure;
use super::types::{Task, TaskId, TaskRecord, TaskSpec, TaskStatus};
use crate::agents::AgentId;
use crate::{Error, Result};

/// All tasks of one workflow run
#[derive(Debug, Default)]
pub struct WorkflowGraph {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order, used for stable traces
    order: Vec<TaskId>,
    roots: Vec<TaskId>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root task owned by `owner`
    pub fn add_root(&mut self, owner: AgentId, payload: JsonValue, max_retries: u32) -> TaskId {
        let id = TaskId::root(self.roots.len());
        let task = Task::new(id.clone(), owner, payload, max_retries);
        self.roots.push(id.clone());
        self.insert(task);
        id
    }

    /// Add a child of `parent` created from a decomposition spec
    pub fn add_child(
        &mut self,
        parent: &TaskId,
        owner: AgentId,
        spec: &TaskSpec,
        default_max_retries: u32,
    ) -> Result<TaskId> {
        let parent_task = self.task(parent)?;
        let id = parent.child(parent_task.children.len() + 1);
        let spawn_attempt = parent_task.retry_count;

        if let Some(replaced) = &spec.replaces {
            let sibling = self.task(replaced)?;
            if sibling.parent.as_ref() != Some(parent) {
                return Err(Error::Other(format!(
                    "task {} cannot replace {}: not a child of {}",
                    id, replaced, parent
                )));
            }
        }

        let mut task = Task::new(
            id.clone(),
            owner,
            spec.payload.clone(),
            spec.max_retries.unwrap_or(default_max_retries),
        );
        task.parent = Some(parent.clone());
        task.spawn_attempt = spawn_attempt;
        task.context = spec.context.clone();
        task.replaces = spec.replaces.clone();

        if let Some(replaced) = &spec.replaces {
            self.task_mut(replaced)?.superseded_by = Some(id.clone());
        }
        self.task_mut(parent)?.children.push(id.clone());
        self.insert(task);
        Ok(id)
    }

    fn insert(&mut self, task: Task) {
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Children of the parent's current attempt, with escalated children
    /// swapped for the replacement that took over their slot.
    ///
    /// Order is the insertion order of the original slots.
    pub fn effective_children(&self, parent: &TaskId) -> Vec<TaskId> {
        let Some(parent_task) = self.tasks.get(parent) else {
            return vec![];
        };

        parent_task
            .children
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|child| {
                child.spawn_attempt == parent_task.retry_count && child.replaces.is_none()
            })
            .map(|child| {
                let mut current = child;
                while let Some(next) = current
                    .superseded_by
                    .as_ref()
                    .and_then(|id| self.tasks.get(id))
                {
                    current = next;
                }
                current.id.clone()
            })
            .collect()
    }

    /// Whether every effective child of `parent` succeeded (vacuously true)
    pub fn children_succeeded(&self, parent: &TaskId) -> bool {
        self.effective_children(parent).iter().all(|id| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Succeeded)
        })
    }

    /// No task is pending, running or waiting on children
    pub fn is_quiescent(&self) -> bool {
        self.tasks.values().all(|t| t.is_retired())
    }

    /// `id` and all of its descendants, preorder
    pub fn subtree(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(task) = self.tasks.get(&current) {
                stack.extend(task.children.iter().rev().cloned());
                out.push(current);
            }
        }
        out
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.iter().map(Task::to_record).collect()
    }

    /// Rebuild a graph from checkpoint records.
    ///
    /// Records must form a forest: unique ids, every parent present, no
    /// task its own ancestor.
    pub fn from_records(records: &[TaskRecord]) -> std::result::Result<Self, Failure> {
        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.id.clone()) {
                return Err(Failure::structural(
                    codes::CYCLE_DETECTED,
                    format!("task {} appears more than once", record.id),
                ));
            }
        }

        let parents: HashMap<&TaskId, Option<&TaskId>> = records
            .iter()
            .map(|r| (&r.id, r.parent_id.as_ref()))
            .collect();

        for record in records {
            if let Some(parent) = &record.parent_id {
                if !parents.contains_key(parent) {
                    return Err(Failure::structural(
                        codes::DANGLING_PARENT,
                        format!("task {} references missing parent {}", record.id, parent),
                    ));
                }
            }

            let mut visited = HashSet::new();
            let mut current = Some(&record.id);
            while let Some(id) = current {
                if !visited.insert(id) {
                    return Err(Failure::structural(
                        codes::CYCLE_DETECTED,
                        format!("task {} is its own ancestor", record.id),
                    ));
                }
                current = parents.get(id).copied().flatten();
            }
        }

        let mut graph = Self::new();
        for record in records {
            let mut task = Task::new(
                record.id.clone(),
                record.owner_agent_id.clone(),
                record.payload.clone(),
                record.max_retries,
            );
            task.status = record.status;
            task.retry_count = record.retry_count;
            task.parent = record.parent_id.clone();
            task.replaces = record.replaces.clone();
            task.artifact = record.artifact.clone();
            task.diagnostics = record.diagnostics.clone();
            if task.parent.is_none() {
                graph.roots.push(task.id.clone());
            }
            graph.insert(task);
        }

        for record in records {
            if let Some(parent) = &record.parent_id {
                if let Some(parent_task) = graph.tasks.get_mut(parent) {
                    parent_task.children.push(record.id.clone());
                }
            }
            if let Some(replaced) = &record.replaces {
                if let Some(replaced_task) = graph.tasks.get_mut(replaced) {
                    replaced_task.superseded_by = Some(record.id.clone());
                }
            }
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph_with_two_children() -> (WorkflowGraph, TaskId, TaskId, TaskId) {
        let mut graph = WorkflowGraph::new();
        let root = graph.add_root(AgentId::new("a"), json!("build"), 2);
        let c1 = graph
            .add_child(&root, AgentId::new("b"), &TaskSpec::for_agent("b", json!(1)), 2)
            .unwrap();
        let c2 = graph
            .add_child(&root, AgentId::new("c"), &TaskSpec::for_agent("c", json!(2)), 2)
            .unwrap();
        (graph, root, c1, c2)
    }

    fn finish(graph: &mut WorkflowGraph, id: &TaskId, status: TaskStatus) {
        let task = graph.task_mut(id).unwrap();
        task.transition(TaskStatus::InProgress).unwrap();
        task.transition(status).unwrap();
    }

    #[test]
    fn test_child_ids_are_hierarchical() {
        let (graph, root, c1, c2) = graph_with_two_children();
        assert_eq!(root.as_str(), "t0");
        assert_eq!(c1.as_str(), "t0.1");
        assert_eq!(c2.as_str(), "t0.2");
        assert_eq!(graph.task(&c2).unwrap().parent, Some(root.clone()));
        assert_eq!(graph.task(&root).unwrap().children, vec![c1, c2]);
    }

    #[test]
    fn test_child_max_retries_defaults() {
        let mut graph = WorkflowGraph::new();
        let root = graph.add_root(AgentId::new("a"), json!(null), 1);
        let explicit = graph
            .add_child(
                &root,
                AgentId::new("b"),
                &TaskSpec::for_agent("b", json!(1)).with_max_retries(5),
                2,
            )
            .unwrap();
        let defaulted = graph
            .add_child(&root, AgentId::new("b"), &TaskSpec::for_agent("b", json!(2)), 2)
            .unwrap();

        assert_eq!(graph.task(&explicit).unwrap().max_retries, 5);
        assert_eq!(graph.task(&defaulted).unwrap().max_retries, 2);
    }

    #[test]
    fn test_replacement_takes_the_escalated_slot() {
        let (mut graph, root, c1, c2) = graph_with_two_children();
        finish(&mut graph, &c1, TaskStatus::Succeeded);
        finish(&mut graph, &c2, TaskStatus::Escalated);

        assert!(!graph.children_succeeded(&root));

        let spec = TaskSpec::for_agent("d", json!(2)).replacing(c2.clone());
        let c3 = graph.add_child(&root, AgentId::new("d"), &spec, 2).unwrap();
        assert_eq!(graph.task(&c2).unwrap().superseded_by, Some(c3.clone()));
        assert_eq!(graph.effective_children(&root), vec![c1.clone(), c3.clone()]);

        finish(&mut graph, &c3, TaskStatus::Succeeded);
        assert!(graph.children_succeeded(&root));
    }

    #[test]
    fn test_replacement_must_be_a_sibling() {
        let (mut graph, _root, c1, c2) = graph_with_two_children();
        let spec = TaskSpec::for_agent("d", json!(2)).replacing(c2);
        assert!(graph.add_child(&c1, AgentId::new("d"), &spec, 2).is_err());
    }

    #[test]
    fn test_effective_children_ignore_previous_attempts() {
        let (mut graph, root, c1, _c2) = graph_with_two_children();
        finish(&mut graph, &c1, TaskStatus::Escalated);

        let task = graph.task_mut(&root).unwrap();
        task.retry_count = 1;
        assert!(graph.effective_children(&root).is_empty());

        let c3 = graph
            .add_child(&root, AgentId::new("b"), &TaskSpec::for_agent("b", json!(3)), 2)
            .unwrap();
        assert_eq!(c3.as_str(), "t0.3");
        assert_eq!(graph.effective_children(&root), vec![c3]);
    }

    #[test]
    fn test_quiescence_and_subtree() {
        let (mut graph, root, c1, c2) = graph_with_two_children();
        assert!(!graph.is_quiescent());
        assert_eq!(graph.subtree(&root), vec![root.clone(), c1.clone(), c2.clone()]);

        finish(&mut graph, &c1, TaskStatus::Succeeded);
        finish(&mut graph, &c2, TaskStatus::Succeeded);
        finish(&mut graph, &root, TaskStatus::Succeeded);
        assert!(graph.is_quiescent());
    }

    #[test]
    fn test_records_round_trip_through_from_records() {
        let (mut graph, root, c1, c2) = graph_with_two_children();
        finish(&mut graph, &c1, TaskStatus::Succeeded);
        finish(&mut graph, &c2, TaskStatus::Escalated);
        let spec = TaskSpec::for_agent("d", json!(2)).replacing(c2.clone());
        let c3 = graph.add_child(&root, AgentId::new("d"), &spec, 2).unwrap();

        let records = graph.records();
        let rebuilt = WorkflowGraph::from_records(&records).unwrap();

        assert_eq!(rebuilt.roots(), &[root.clone()]);
        assert_eq!(rebuilt.task(&root).unwrap().children, vec![c1, c2.clone(), c3.clone()]);
        assert_eq!(rebuilt.task(&c2).unwrap().superseded_by, Some(c3));
        assert_eq!(rebuilt.records(), records);
    }

    #[test]
    fn test_from_records_detects_cycles() {
        let mut a = Task::new(TaskId::new("a"), AgentId::new("x"), json!(null), 0).to_record();
        let mut b = Task::new(TaskId::new("b"), AgentId::new("x"), json!(null), 0).to_record();
        a.parent_id = Some(TaskId::new("b"));
        b.parent_id = Some(TaskId::new("a"));

        let err = WorkflowGraph::from_records(&[a, b]).unwrap_err();
        assert_eq!(err.code, codes::CYCLE_DETECTED);
    }

    #[test]
    fn test_from_records_detects_dangling_parent() {
        let mut a = Task::new(TaskId::new("a"), AgentId::new("x"), json!(null), 0).to_record();
        a.parent_id = Some(TaskId::new("ghost"));

        let err = WorkflowGraph::from_records(&[a]).unwrap_err();
        assert_eq!(err.code, codes::DANGLING_PARENT);
    }
}
