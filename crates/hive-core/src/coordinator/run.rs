//! State of one workflow run
//!
//! The run loop works in rounds. A round dispatches every slot the scheduler
//! hands out, then waits until each running runtime has reported its next
//! event (a completion or a delegation) and applies the events in dispatch
//! order. Control messages are handled while waiting.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Control, ControlReceiver, RunReport, RunTrace, WorkflowOutcome};
use crate::agents::{
    AgentHierarchy, AgentId, AgentRuntime, ChildReport, Delegator, Job, JoinOutcome,
};
use crate::checkpoint::CheckpointStore;
use crate::feedback::{Classification, FeedbackController};
use crate::scheduler::{DelegationScheduler, SchedulerLimits, Slot};
use crate::task::{
    Diagnostic, Failure, TaskId, TaskResult, TaskSpec, TaskStatus, WorkflowGraph, codes,
};
use crate::{Error, Result};

pub(super) enum EventKind {
    Completed(TaskResult),
    Delegated {
        children: Vec<TaskSpec>,
        reply: oneshot::Sender<JoinOutcome>,
    },
}

pub(super) struct Event {
    task_id: TaskId,
    kind: EventKind,
}

/// Delegator handed to one runtime invocation
struct ChannelDelegator {
    task_id: TaskId,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Delegator for ChannelDelegator {
    async fn delegate(&self, children: Vec<TaskSpec>) -> JoinOutcome {
        let (reply, rx) = oneshot::channel();
        let event = Event {
            task_id: self.task_id.clone(),
            kind: EventKind::Delegated { children, reply },
        };
        if self.events.send(event).is_err() {
            return JoinOutcome::Cancelled;
        }
        rx.await.unwrap_or(JoinOutcome::Cancelled)
    }
}

struct Join {
    /// Children in the order of the delegated specs
    members: Vec<TaskId>,
    reply: oneshot::Sender<JoinOutcome>,
}

pub(super) struct RunSettings {
    pub limits: SchedulerLimits,
    pub default_max_retries: u32,
    pub backoff: Duration,
}

pub(super) struct Run {
    run_id: String,
    graph: WorkflowGraph,
    scheduler: DelegationScheduler,
    feedback: FeedbackController,
    runtime: Arc<AgentRuntime>,
    default_max_retries: u32,
    backoff: Duration,
    root_cancel: CancellationToken,
    tokens: HashMap<TaskId, CancellationToken>,
    /// Tasks whose runtime is executing, with their dispatch sequence
    running: HashMap<TaskId, u64>,
    joins: HashMap<TaskId, Join>,
    join_of: HashMap<TaskId, TaskId>,
    /// Resolved joins waiting for their parent to get a slot
    ready: HashMap<TaskId, (oneshot::Sender<JoinOutcome>, JoinOutcome)>,
    events: mpsc::UnboundedSender<Event>,
    workers: JoinSet<()>,
    dispatch_order: Vec<TaskId>,
    cancelled: bool,
    failure: Option<Vec<Diagnostic>>,
}

impl Run {
    pub fn new(
        run_id: String,
        graph: WorkflowGraph,
        runtime: Arc<AgentRuntime>,
        settings: RunSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let scheduler =
            DelegationScheduler::new(runtime.hierarchy().ids().iter().cloned(), settings.limits);
        let run = Self {
            run_id,
            graph,
            scheduler,
            feedback: FeedbackController::new(),
            runtime,
            default_max_retries: settings.default_max_retries,
            backoff: settings.backoff,
            root_cancel: CancellationToken::new(),
            tokens: HashMap::new(),
            running: HashMap::new(),
            joins: HashMap::new(),
            join_of: HashMap::new(),
            ready: HashMap::new(),
            events,
            workers: JoinSet::new(),
            dispatch_order: Vec::new(),
            cancelled: false,
            failure: None,
        };
        (run, events_rx)
    }

    fn hierarchy(&self) -> &AgentHierarchy {
        self.runtime.hierarchy()
    }

    /// Queue every pending root task of the graph
    pub fn submit_roots(&mut self) -> Result<()> {
        let roots: Vec<TaskId> = self.graph.roots().to_vec();
        for root in roots {
            let task = self.graph.task(&root)?;
            if task.status != TaskStatus::Pending {
                continue;
            }
            let owner = task.owner.clone();
            let attempt = task.retry_count;
            self.tokens
                .insert(root.clone(), self.root_cancel.child_token());
            if let Err(failure) = self.scheduler.submit(root.clone(), owner.clone()) {
                self.reject(&root, &owner, attempt, failure, TaskStatus::Failed)?;
                self.record_root_failure(&root)?;
            }
        }
        Ok(())
    }

    /// Drive the run until no task is pending, running or waiting
    pub async fn drive(
        mut self,
        events: &mut mpsc::UnboundedReceiver<Event>,
        control: &mut ControlReceiver,
        checkpoint: Option<&CheckpointStore>,
    ) -> Result<RunReport> {
        info!(
            "Workflow run {} started with {} root tasks",
            self.run_id,
            self.graph.roots().len()
        );

        loop {
            for message in control.drain() {
                self.handle_control(message)?;
            }

            for slot in self.scheduler.dispatch() {
                self.start(slot)?;
            }
            if self.running.is_empty() {
                break;
            }

            let round = self.barrier(events, control).await?;
            for event in round {
                self.apply(event)?;
            }
            self.checkpoint(checkpoint);
        }

        while self.workers.join_next().await.is_some() {}
        self.checkpoint(checkpoint);

        let outcome = self.outcome()?;
        match &outcome {
            WorkflowOutcome::Completed(artifacts) => info!(
                "Workflow run {} completed with {} artifacts",
                self.run_id,
                artifacts.len()
            ),
            WorkflowOutcome::Failed(chain) => warn!(
                "Workflow run {} failed: {}",
                self.run_id,
                chain
                    .last()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "no diagnostic".to_string())
            ),
            WorkflowOutcome::Cancelled => info!("Workflow run {} cancelled", self.run_id),
        }

        Ok(RunReport {
            run_id: self.run_id,
            outcome,
            trace: RunTrace {
                dispatch_order: self.dispatch_order,
                records: self.graph.records(),
            },
        })
    }

    fn checkpoint(&self, store: Option<&CheckpointStore>) {
        if let Some(store) = store {
            if let Err(e) = store.save_run(&self.run_id, &self.graph.records()) {
                warn!("Failed to checkpoint run {}: {}", self.run_id, e);
            }
        }
    }

    /// Wait for one event from every running task
    async fn barrier(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<Event>,
        control: &mut ControlReceiver,
    ) -> Result<Vec<Event>> {
        let mut awaiting: HashSet<TaskId> = self.running.keys().cloned().collect();
        let mut round = Vec::with_capacity(awaiting.len());

        while !awaiting.is_empty() {
            tokio::select! {
                biased;
                message = control.recv(), if control.is_open() => {
                    if let Some(message) = message {
                        self.handle_control(message)?;
                    }
                }
                event = events.recv() => {
                    let event = event
                        .ok_or_else(|| Error::Other("event channel closed".to_string()))?;
                    if awaiting.remove(&event.task_id) {
                        round.push(event);
                    } else {
                        warn!("Dropping unexpected event for task {}", event.task_id);
                    }
                }
            }
        }

        round.sort_by_key(|e| self.running.get(&e.task_id).copied().unwrap_or(u64::MAX));
        Ok(round)
    }

    fn start(&mut self, slot: Slot) -> Result<()> {
        let seq = slot.seq();
        match slot {
            Slot::Start { task_id, agent, .. } => {
                let task = self.graph.task_mut(&task_id)?;
                task.transition(TaskStatus::InProgress)?;
                let job = Job {
                    task_id: task_id.clone(),
                    payload: task.payload.clone(),
                    context: task.context.clone(),
                    attempt: task.retry_count,
                };
                debug!(
                    "Dispatch {} to {} (attempt {}, seq {})",
                    task_id, agent, job.attempt, seq
                );

                let token = self
                    .tokens
                    .entry(task_id.clone())
                    .or_insert_with(|| self.root_cancel.child_token())
                    .clone();
                self.running.insert(task_id.clone(), seq);
                self.dispatch_order.push(task_id);
                self.spawn_worker(agent, job, token);
            }
            Slot::Resume { task_id, agent, .. } => {
                let (reply, outcome) = self.ready.remove(&task_id).ok_or_else(|| {
                    Error::Other(format!("task {} resumed without a join outcome", task_id))
                })?;
                self.graph
                    .task_mut(&task_id)?
                    .transition(TaskStatus::InProgress)?;
                debug!("Resume {} on {} (seq {})", task_id, agent, seq);

                if reply.send(outcome).is_ok() {
                    self.running.insert(task_id, seq);
                    return Ok(());
                }

                warn!("Runtime of task {} is gone, releasing its slot", task_id);
                self.scheduler.release(&agent);
                let attempt = self.graph.task(&task_id)?.retry_count;
                let result = TaskResult::failed(
                    task_id.clone(),
                    &agent,
                    attempt,
                    Failure::structural(codes::RUNTIME_PANIC, "runtime dropped its join"),
                    vec![],
                    vec![],
                );
                self.complete(&task_id, agent, result)?;
            }
        }
        Ok(())
    }

    fn spawn_worker(&mut self, agent: AgentId, job: Job, token: CancellationToken) {
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        let backoff = self.backoff;

        self.workers.spawn(async move {
            let task_id = job.task_id.clone();
            let attempt = job.attempt;
            let delegator = ChannelDelegator {
                task_id: task_id.clone(),
                events: events.clone(),
            };

            let execution = async {
                if attempt > 0 && !backoff.is_zero() {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                runtime.execute(&agent, job, &delegator, &token).await
            };

            let result = match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(result) => result,
                Err(_) => TaskResult::failed(
                    task_id.clone(),
                    &agent,
                    attempt,
                    Failure::structural(codes::RUNTIME_PANIC, "agent runtime panicked"),
                    vec![],
                    vec![],
                ),
            };

            let _ = events.send(Event {
                task_id,
                kind: EventKind::Completed(result),
            });
        });
    }

    fn apply(&mut self, event: Event) -> Result<()> {
        let owner = self.graph.task(&event.task_id)?.owner.clone();
        self.running.remove(&event.task_id);
        self.scheduler.release(&owner);

        match event.kind {
            EventKind::Completed(result) => self.complete(&event.task_id, owner, result),
            EventKind::Delegated { children, reply } => {
                self.delegate(&event.task_id, owner, children, reply)
            }
        }
    }

    fn complete(&mut self, task_id: &TaskId, owner: AgentId, result: TaskResult) -> Result<()> {
        // A cancelled task never retries or escalates, whatever its runtime reported
        let result = if self.is_cancelled(task_id) && !result.is_cancellation() {
            let attempt = self.graph.task(task_id)?.retry_count;
            TaskResult::failed(
                task_id.clone(),
                &owner,
                attempt,
                Failure::cancelled(),
                result.diagnostics,
                result.spawned,
            )
        } else {
            result
        };

        match self.feedback.apply(&mut self.graph, result)? {
            Classification::Retry => {
                if let Err(failure) = self.scheduler.submit(task_id.clone(), owner.clone()) {
                    let attempt = self.graph.task(task_id)?.retry_count;
                    self.reject(task_id, &owner, attempt, failure, TaskStatus::Escalated)?;
                    self.retire(task_id)?;
                }
            }
            Classification::Fail if self.graph.task(task_id)?.parent.is_none() => {
                self.record_root_failure(task_id)?;
                self.retire(task_id)?;
            }
            Classification::Accept | Classification::Escalate | Classification::Fail => {
                self.retire(task_id)?;
            }
        }
        Ok(())
    }

    /// Remember the first failed root and stop everything else
    fn record_root_failure(&mut self, root: &TaskId) -> Result<()> {
        if self.cancelled || self.failure.is_some() {
            return Ok(());
        }
        let chain = self.graph.task(root)?.diagnostics.clone();
        warn!("Root task {} failed, cancelling remaining work", root);
        self.failure = Some(chain);
        self.root_cancel.cancel();
        let roots: Vec<TaskId> = self.graph.roots().to_vec();
        for other in roots.iter().filter(|r| *r != root) {
            self.cancel_subtree(other)?;
        }
        Ok(())
    }

    fn delegate(
        &mut self,
        parent: &TaskId,
        owner: AgentId,
        children: Vec<TaskSpec>,
        reply: oneshot::Sender<JoinOutcome>,
    ) -> Result<()> {
        self.graph
            .task_mut(parent)?
            .transition(TaskStatus::AwaitingChildren)?;

        if self.is_cancelled(parent) {
            self.ready
                .insert(parent.clone(), (reply, JoinOutcome::Cancelled));
            self.scheduler.enqueue_resume(parent.clone(), owner);
            return Ok(());
        }

        let parent_token = self
            .tokens
            .get(parent)
            .cloned()
            .unwrap_or_else(|| self.root_cancel.child_token());
        let mut members = Vec::with_capacity(children.len());

        for mut spec in children {
            if let Some(replaced) = spec.replaces.clone() {
                if !self.can_replace(parent, &replaced) {
                    warn!(
                        "Task {} cannot replace {}, delegating as a new child",
                        parent, replaced
                    );
                    spec.replaces = None;
                }
            }

            let resolved = self.hierarchy().resolve(&owner, &spec.target);
            let child_owner = resolved
                .clone()
                .unwrap_or_else(|| AgentId::new(spec.target.to_string()));
            let child =
                self.graph
                    .add_child(parent, child_owner.clone(), &spec, self.default_max_retries)?;
            self.tokens.insert(child.clone(), parent_token.child_token());
            self.join_of.insert(child.clone(), parent.clone());
            members.push(child.clone());

            let submitted = match resolved {
                Some(agent) => self.scheduler.submit(child.clone(), agent),
                None => Err(Failure::structural(
                    codes::NO_SUCH_AGENT,
                    format!("{} has no child agent {}", owner, spec.target),
                )),
            };
            if let Err(failure) = submitted {
                self.reject(&child, &child_owner, 0, failure, TaskStatus::Escalated)?;
            }
        }

        info!("Task {} delegated {} children", parent, members.len());
        self.joins.insert(parent.clone(), Join { members, reply });
        self.check_join(parent)
    }

    fn can_replace(&self, parent: &TaskId, replaced: &TaskId) -> bool {
        self.graph.get(replaced).is_some_and(|task| {
            task.parent.as_ref() == Some(parent)
                && task.is_retired()
                && task.status != TaskStatus::Succeeded
                && task.superseded_by.is_none()
        })
    }

    /// Fail a task that could not be queued; its retry count stays unchanged
    fn reject(
        &mut self,
        task_id: &TaskId,
        owner: &AgentId,
        attempt: u32,
        failure: Failure,
        status: TaskStatus,
    ) -> Result<()> {
        warn!("Task {} rejected: {}", task_id, failure);
        let task = self.graph.task_mut(task_id)?;
        task.diagnostics.push(failure.at(task_id, owner, attempt));
        task.transition(status)
    }

    /// A task reached a terminal status; wake its parent if the join is done
    fn retire(&mut self, task_id: &TaskId) -> Result<()> {
        match self.join_of.remove(task_id) {
            Some(parent) => self.check_join(&parent),
            None => Ok(()),
        }
    }

    fn check_join(&mut self, parent: &TaskId) -> Result<()> {
        let Some(join) = self.joins.get(parent) else {
            return Ok(());
        };
        let resolved = join
            .members
            .iter()
            .all(|m| self.graph.get(m).is_some_and(|t| t.is_retired()));
        if !resolved {
            return Ok(());
        }

        let Some(join) = self.joins.remove(parent) else {
            return Ok(());
        };
        let mut reports = Vec::with_capacity(join.members.len());
        for member in &join.members {
            let task = self.graph.task(member)?;
            reports.push(ChildReport::from_task(task, self.tried(member)));
        }

        debug!("Join of task {} resolved ({} children)", parent, reports.len());
        let owner = self.graph.task(parent)?.owner.clone();
        self.ready
            .insert(parent.clone(), (join.reply, JoinOutcome::Resolved(reports)));
        self.scheduler.enqueue_resume(parent.clone(), owner);
        Ok(())
    }

    /// Owners that held the slot of `task_id`, oldest first
    fn tried(&self, task_id: &TaskId) -> Vec<AgentId> {
        let mut owners = Vec::new();
        let mut current = self.graph.get(task_id);
        while let Some(task) = current {
            owners.push(task.owner.clone());
            current = task.replaces.as_ref().and_then(|id| self.graph.get(id));
        }
        owners.reverse();
        owners
    }

    fn is_cancelled(&self, task_id: &TaskId) -> bool {
        self.tokens
            .get(task_id)
            .is_some_and(|t| t.is_cancelled())
    }

    fn handle_control(&mut self, message: Control) -> Result<()> {
        match message {
            Control::CancelWorkflow => {
                if self.cancelled {
                    return Ok(());
                }
                info!("Cancelling workflow run {}", self.run_id);
                self.cancelled = true;
                self.root_cancel.cancel();
                let roots: Vec<TaskId> = self.graph.roots().to_vec();
                for root in &roots {
                    self.cancel_subtree(root)?;
                }
            }
            Control::CancelTask(task_id) => {
                if self.graph.get(&task_id).is_none() {
                    warn!("Ignoring cancellation of unknown task {}", task_id);
                    return Ok(());
                }
                info!("Cancelling task {} and its descendants", task_id);
                self.cancel_subtree(&task_id)?;
            }
        }
        Ok(())
    }

    /// Cancel `task_id` and every descendant that has not retired.
    ///
    /// Running tasks see their token and stop at the next suspension point;
    /// queued tasks fail right away; waiting parents get a cancelled join.
    fn cancel_subtree(&mut self, task_id: &TaskId) -> Result<()> {
        for id in self.graph.subtree(task_id) {
            if let Some(token) = self.tokens.get(&id) {
                token.cancel();
            }

            match self.graph.task(&id)?.status {
                TaskStatus::Pending => {
                    if self.scheduler.withdraw(&id) {
                        let task = self.graph.task(&id)?;
                        let (owner, attempt) = (task.owner.clone(), task.retry_count);
                        self.reject(
                            &id,
                            &owner,
                            attempt,
                            Failure::cancelled(),
                            TaskStatus::Failed,
                        )?;
                        self.retire(&id)?;
                    }
                }
                TaskStatus::AwaitingChildren => self.cancel_join(&id)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn cancel_join(&mut self, parent: &TaskId) -> Result<()> {
        if let Some(join) = self.joins.remove(parent) {
            for member in &join.members {
                self.join_of.remove(member);
            }
            let owner = self.graph.task(parent)?.owner.clone();
            self.ready
                .insert(parent.clone(), (join.reply, JoinOutcome::Cancelled));
            self.scheduler.enqueue_resume(parent.clone(), owner);
        } else if let Some((_, outcome)) = self.ready.get_mut(parent) {
            *outcome = JoinOutcome::Cancelled;
        }
        Ok(())
    }

    fn outcome(&self) -> Result<WorkflowOutcome> {
        if self.cancelled {
            return Ok(WorkflowOutcome::Cancelled);
        }
        if let Some(chain) = &self.failure {
            return Ok(WorkflowOutcome::Failed(chain.clone()));
        }

        let mut artifacts = Vec::with_capacity(self.graph.roots().len());
        for root in self.graph.roots() {
            let task = self.graph.task(root)?;
            match (&task.status, &task.artifact) {
                (TaskStatus::Succeeded, Some(artifact)) => artifacts.push(artifact.clone()),
                _ => return Ok(WorkflowOutcome::Failed(task.diagnostics.clone())),
            }
        }
        Ok(WorkflowOutcome::Completed(artifacts))
    }
}
