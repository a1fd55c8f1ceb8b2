//! Delegation scheduler
//!
//! Single owner of the in-flight budget. New work is dispatched in global
//! submission order (so per-agent FIFO holds too), resumptions of parents
//! whose join resolved go first. A task that cannot start because its agent
//! is at capacity does not block work queued behind it for other agents.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::agents::AgentId;
use crate::task::{Failure, TaskId, codes};

/// Concurrency bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    /// Running tasks across all agents
    pub max_in_flight: usize,
    /// Running tasks per agent (0 = unbounded)
    pub per_agent: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            per_agent: 0,
        }
    }
}

/// An execution slot handed out by `dispatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Start a new attempt of the task
    Start {
        task_id: TaskId,
        agent: AgentId,
        seq: u64,
    },
    /// Wake a parent whose children resolved
    Resume {
        task_id: TaskId,
        agent: AgentId,
        seq: u64,
    },
}

impl Slot {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Start { task_id, .. } | Self::Resume { task_id, .. } => task_id,
        }
    }

    pub fn agent(&self) -> &AgentId {
        match self {
            Self::Start { agent, .. } | Self::Resume { agent, .. } => agent,
        }
    }

    /// Dispatch sequence number, strictly increasing per scheduler
    pub fn seq(&self) -> u64 {
        match self {
            Self::Start { seq, .. } | Self::Resume { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    task_id: TaskId,
    agent: AgentId,
}

/// Queue and capacity bookkeeping for one workflow run
#[derive(Debug)]
pub struct DelegationScheduler {
    agents: HashSet<AgentId>,
    limits: SchedulerLimits,
    pending: VecDeque<Queued>,
    resumes: VecDeque<Queued>,
    running: HashMap<AgentId, usize>,
    in_flight: usize,
    next_seq: u64,
}

impl DelegationScheduler {
    pub fn new(agents: impl IntoIterator<Item = AgentId>, limits: SchedulerLimits) -> Self {
        Self {
            agents: agents.into_iter().collect(),
            limits,
            pending: VecDeque::new(),
            resumes: VecDeque::new(),
            running: HashMap::new(),
            in_flight: 0,
            next_seq: 0,
        }
    }

    /// Enqueue a pending task for `agent`.
    ///
    /// Fails with `no-such-agent` when the agent is not part of the run;
    /// nothing is queued in that case.
    pub fn submit(&mut self, task_id: TaskId, agent: AgentId) -> Result<(), Failure> {
        if !self.agents.contains(&agent) {
            return Err(Failure::structural(
                codes::NO_SUCH_AGENT,
                format!("task {} targets unknown agent {}", task_id, agent),
            ));
        }
        debug!("Queued task {} for agent {}", task_id, agent);
        self.pending.push_back(Queued { task_id, agent });
        Ok(())
    }

    /// Queue the resumption of a suspended parent
    pub fn enqueue_resume(&mut self, task_id: TaskId, agent: AgentId) {
        self.resumes.push_back(Queued { task_id, agent });
    }

    /// Remove a task that has not been dispatched yet
    pub fn withdraw(&mut self, task_id: &TaskId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|q| &q.task_id != task_id);
        before != self.pending.len()
    }

    /// Hand out every slot the limits allow, resumptions first
    pub fn dispatch(&mut self) -> Vec<Slot> {
        let mut slots = Vec::new();

        let resumes = std::mem::take(&mut self.resumes);
        self.resumes = self.drain(resumes, &mut slots, true);

        let pending = std::mem::take(&mut self.pending);
        self.pending = self.drain(pending, &mut slots, false);

        if !slots.is_empty() {
            debug!(
                "Dispatched {} slots ({} in flight, {} queued)",
                slots.len(),
                self.in_flight,
                self.pending.len() + self.resumes.len()
            );
        }
        slots
    }

    fn drain(
        &mut self,
        queue: VecDeque<Queued>,
        slots: &mut Vec<Slot>,
        resume: bool,
    ) -> VecDeque<Queued> {
        let mut left = VecDeque::new();
        for queued in queue {
            if !self.has_capacity(&queued.agent) {
                left.push_back(queued);
                continue;
            }

            self.in_flight += 1;
            *self.running.entry(queued.agent.clone()).or_default() += 1;
            let seq = self.next_seq;
            self.next_seq += 1;

            slots.push(if resume {
                Slot::Resume {
                    task_id: queued.task_id,
                    agent: queued.agent,
                    seq,
                }
            } else {
                Slot::Start {
                    task_id: queued.task_id,
                    agent: queued.agent,
                    seq,
                }
            });
        }
        left
    }

    fn has_capacity(&self, agent: &AgentId) -> bool {
        if self.in_flight >= self.limits.max_in_flight {
            return false;
        }
        self.limits.per_agent == 0
            || self.running.get(agent).copied().unwrap_or(0) < self.limits.per_agent
    }

    /// Give back the slot held by a task of `agent` (completed or suspended)
    pub fn release(&mut self, agent: &AgentId) {
        if let Some(count) = self.running.get_mut(agent) {
            if *count > 0 {
                *count -= 1;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Tasks and resumptions waiting for a slot
    pub fn queued(&self) -> usize {
        self.pending.len() + self.resumes.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.queued() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(limits: SchedulerLimits) -> DelegationScheduler {
        DelegationScheduler::new(
            vec![AgentId::new("a"), AgentId::new("b"), AgentId::new("c")],
            limits,
        )
    }

    fn ids(slots: &[Slot]) -> Vec<&str> {
        slots.iter().map(|s| s.task_id().as_str()).collect()
    }

    #[test]
    fn test_submit_unknown_agent() {
        let mut s = scheduler(SchedulerLimits::default());
        let err = s.submit(TaskId::new("t0.1"), AgentId::new("ghost")).unwrap_err();
        assert_eq!(err.code, codes::NO_SUCH_AGENT);
        assert!(!err.kind.is_retryable());
        assert_eq!(s.queued(), 0);
    }

    #[test]
    fn test_dispatch_fifo_with_increasing_seq() {
        let mut s = scheduler(SchedulerLimits::default());
        s.submit(TaskId::new("t0.1"), AgentId::new("b")).unwrap();
        s.submit(TaskId::new("t0.2"), AgentId::new("c")).unwrap();
        s.submit(TaskId::new("t0.3"), AgentId::new("b")).unwrap();

        let slots = s.dispatch();
        assert_eq!(ids(&slots), vec!["t0.1", "t0.2", "t0.3"]);
        assert_eq!(slots.iter().map(Slot::seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(s.in_flight(), 3);
        assert!(s.dispatch().is_empty());
    }

    #[test]
    fn test_per_agent_bound_skips_to_other_agents() {
        let mut s = scheduler(SchedulerLimits {
            max_in_flight: 10,
            per_agent: 1,
        });
        s.submit(TaskId::new("t0.1"), AgentId::new("b")).unwrap();
        s.submit(TaskId::new("t0.2"), AgentId::new("b")).unwrap();
        s.submit(TaskId::new("t0.3"), AgentId::new("c")).unwrap();

        assert_eq!(ids(&s.dispatch()), vec!["t0.1", "t0.3"]);
        assert_eq!(s.queued(), 1);

        s.release(&AgentId::new("b"));
        assert_eq!(ids(&s.dispatch()), vec!["t0.2"]);
    }

    #[test]
    fn test_global_budget() {
        let mut s = scheduler(SchedulerLimits {
            max_in_flight: 2,
            per_agent: 0,
        });
        for i in 1..=4 {
            s.submit(TaskId::new(format!("t0.{}", i)), AgentId::new("b")).unwrap();
        }

        assert_eq!(ids(&s.dispatch()), vec!["t0.1", "t0.2"]);
        s.release(&AgentId::new("b"));
        assert_eq!(ids(&s.dispatch()), vec!["t0.3"]);
        assert_eq!(s.in_flight(), 2);
    }

    #[test]
    fn test_resumes_go_first() {
        let mut s = scheduler(SchedulerLimits {
            max_in_flight: 1,
            per_agent: 0,
        });
        s.submit(TaskId::new("t1"), AgentId::new("a")).unwrap();
        s.enqueue_resume(TaskId::new("t0"), AgentId::new("a"));

        let slots = s.dispatch();
        assert_eq!(slots.len(), 1);
        assert!(matches!(&slots[0], Slot::Resume { task_id, .. } if task_id.as_str() == "t0"));
    }

    #[test]
    fn test_withdraw_and_release() {
        let mut s = scheduler(SchedulerLimits::default());
        s.submit(TaskId::new("t0.1"), AgentId::new("b")).unwrap();
        assert!(s.withdraw(&TaskId::new("t0.1")));
        assert!(!s.withdraw(&TaskId::new("t0.1")));
        assert!(s.is_idle());

        // releasing an agent with nothing running is a no-op
        s.release(&AgentId::new("b"));
        assert_eq!(s.in_flight(), 0);
    }
}
