//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.
//!
//! Failures that happen while an agent is *running* (a tool that errors, a
//! step that exhausts its retries, an unhandled intent) are reported as
//! structured values instead: [`crate::ToolOutput`], [`crate::PlanOutcome`],
//! or a `None` reply.  The variants below cover the remaining cases.

use std::time::Duration;

use uuid::Uuid;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Tool errors ---------------------------------------------------------
    /// No tool with this name is registered.
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    /// Parameters did not satisfy the tool's schema.
    #[error("invalid parameters for `{tool_name}`: {reason}")]
    ParameterValidation { tool_name: String, reason: String },

    /// A tool invocation failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// A tool or step did not finish within its timeout.
    #[error("`{operation}` timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    // -- Planner errors ------------------------------------------------------
    /// The planner could not produce a plan for the goal.
    #[error("planning failed: {reason}")]
    PlanningFailed { reason: String },

    /// A step failed after exhausting its retries.
    #[error("step {step_id} failed after {attempts} attempts: {reason}")]
    StepExecutionFailed {
        step_id: Uuid,
        attempts: u32,
        reason: String,
    },

    // -- Agent errors --------------------------------------------------------
    /// The operation needs a channel but none is attached.
    #[error("agent `{agent_id}` has no channel attached")]
    NoChannel { agent_id: String },

    /// The operation needs a planner but none is attached.
    #[error("agent `{agent_id}` has no planner attached")]
    NoPlanner { agent_id: String },

    /// The agent has been stopped and cannot be restarted.
    #[error("agent `{agent_id}` is stopped")]
    AgentStopped { agent_id: String },

    /// A message is malformed for the requested operation.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Reading a file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] agentkit_kernel::KernelError),

    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] agentkit_store::StoreError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;
