//! Agent hierarchy and runtime
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     AgentHierarchy                           │
//! │            planner                                           │
//! │           ┌───┴────┬──────────┐                              │
//! │        engineer  engineer     qa                             │
//! │           │                                                  │
//! │         micro                                                │
//! └─────────────────────────────────────────────────────────────┘
//!         │ agent + strategy (by role)
//!         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     AgentRuntime                             │
//! │  Perceive → Decide → Act → Report                            │
//! │                       │                                      │
//! │                       └─ Delegator (children, then join)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hive_core::agents::{AgentHierarchy, AgentRole, AgentSpec};
//!
//! let specs = vec![
//!     AgentSpec::new("lead", AgentRole::Planner, "planner-model"),
//!     AgentSpec::new("dev", AgentRole::Engineer, "coder-model").child_of("lead"),
//! ];
//! let hierarchy = AgentHierarchy::build(&specs, &models, &tools, None)?;
//! ```

pub mod hierarchy;
pub mod runtime;
pub mod strategy;
pub mod types;

// Re-exports
pub use hierarchy::AgentHierarchy;
pub use runtime::{AgentRuntime, Delegator, Job, JoinOutcome, RuntimeLimits};
pub use strategy::{
    ChildReport, DecideContext, DecideStrategy, Decision, ModelPlanStrategy, Perception,
    Recovery, StrategyRegistry, ValidationStrategy, collect_artifacts, parse_decision,
    substitute_failed,
};
pub use types::{Agent, AgentId, AgentRole, AgentSpec};
