//! # agentkit-agent
//!
//! The agent runtime.  This crate ties the messaging kernel and the memory
//! store together into autonomous agents that invoke tools and pursue
//! goals.
//!
//! ## Modules
//!
//! - [`tool`] -- The [`Tool`] contract, its parameter schema and
//!   [`invoke_tool`], which validates and times every call.
//! - [`goal`] -- [`Goal`], [`Plan`] and [`PlanStep`] with their status
//!   transitions.
//! - [`repository`] -- Persistence for goals and plans.
//! - [`planner`] -- Plan execution with retry and replanning, plus the
//!   hierarchical and goal-oriented planners.
//! - [`agent`] -- The [`Agent`] state machine and message dispatcher.
//! - [`config`] -- [`RuntimeConfig`], loaded from TOML and the environment.
//! - [`error`] -- [`AgentError`] and the crate `Result` alias.

pub mod agent;
pub mod config;
pub mod error;
pub mod goal;
pub mod planner;
pub mod repository;
pub mod tool;

pub use agent::{
    Agent, AgentBuilder, AgentState, MESSAGES_CATEGORY, MessageHandler, TOOL_EXECUTIONS_CATEGORY,
    WeakAgent, handler,
};
pub use config::{AgentSection, MemorySection, RuntimeConfig};
pub use error::{AgentError, Result};
pub use goal::{Goal, Plan, PlanStep, StepAction, StepCallable, TaskStatus, step_callable};
pub use planner::{
    ActionSpec, ExecutionContext, GoalOrientedPlanner, HierarchicalPlanner, PROCESS_SUBGOAL,
    PlanOutcome, PlanRunner, Planner, PlannerConfig, TEMPLATE_STEPS, ToolInvoker,
};
pub use repository::{InMemoryPlanRepository, PlanRepository};
pub use tool::{
    FnTool, ParamSpec, ParamType, Params, Tool, ToolOutput, ToolStatus, Validator, invoke_tool,
    validate_params,
};
