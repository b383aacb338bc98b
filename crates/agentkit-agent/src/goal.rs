//! Goals, plans and plan steps.
//!
//! A [`Goal`] describes a desired outcome.  A planner turns it into a
//! [`Plan`]: an ordered list of [`PlanStep`]s plus a cursor.  Status fields
//! only change through the explicit transition methods or the plan
//! executor; nothing transitions on its own.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::tool::Params;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle shared by goals, plans and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Goal
// ---------------------------------------------------------------------------

/// A desired outcome, optionally decomposed into subgoals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Higher is more important.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Direct children, in order.
    #[serde(default)]
    pub subgoals: Vec<Goal>,
    /// Goals that must finish first.
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    /// World-state facts that hold once the goal is achieved.
    #[serde(default)]
    pub conditions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: description.into(),
            priority: 0,
            deadline: None,
            status: TaskStatus::Pending,
            subgoals: Vec::new(),
            dependencies: BTreeSet::new(),
            conditions: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_subgoal(mut self, subgoal: Goal) -> Self {
        self.subgoals.push(subgoal);
        self
    }

    pub fn with_dependency(mut self, goal_id: Uuid) -> Self {
        self.dependencies.insert(goal_id);
        self
    }

    pub fn with_condition(mut self, fact: impl Into<String>) -> Self {
        self.conditions.insert(fact.into());
        self
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
    }

    pub fn fail(&mut self) {
        self.status = TaskStatus::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Deadline has passed.  Informational; nothing acts on it.
    pub fn is_overdue(&self) -> bool {
        self.deadline.is_some_and(|d| Utc::now() > d)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Async function a step can run directly instead of naming a tool.
pub type StepCallable = Arc<dyn Fn(Params) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`StepCallable`].
pub fn step_callable<F, Fut>(f: F) -> StepCallable
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

/// What a step does when it runs.
#[derive(Clone)]
pub enum StepAction {
    /// Invoke a tool through the execution context's invoker.
    Tool(String),
    /// Run a function directly.
    Callable { name: String, func: StepCallable },
}

impl StepAction {
    pub fn name(&self) -> &str {
        match self {
            Self::Tool(name) | Self::Callable { name, .. } => name,
        }
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool(name) => f.debug_tuple("Tool").field(name).finish(),
            Self::Callable { name, .. } => f.debug_tuple("Callable").field(name).finish(),
        }
    }
}

/// One unit of work inside a [`Plan`].
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub id: Uuid,
    pub action: StepAction,
    pub parameters: Params,
    pub expected_outcome: String,
    pub timeout: Option<Duration>,
    /// Retries allowed after the first failure.
    pub retry_count: u32,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Retries consumed so far.
    pub retry_attempts: u32,
    pub dependencies: Vec<Uuid>,
}

impl PlanStep {
    fn with_action(action: StepAction) -> Self {
        Self {
            id: Uuid::now_v7(),
            action,
            parameters: Map::new(),
            expected_outcome: String::new(),
            timeout: None,
            retry_count: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_attempts: 0,
            dependencies: Vec::new(),
        }
    }

    /// A step that calls the named tool.
    pub fn tool(name: impl Into<String>) -> Self {
        Self::with_action(StepAction::Tool(name.into()))
    }

    /// A step that runs `func` directly.
    pub fn callable(name: impl Into<String>, func: StepCallable) -> Self {
        Self::with_action(StepAction::Callable {
            name: name.into(),
            func,
        })
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: Params) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn with_expected_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = outcome.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn depends_on(mut self, step_id: Uuid) -> Self {
        self.dependencies.push(step_id);
        self
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    /// A failed step with retry budget left.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_attempts < self.retry_count
    }

    /// Attempts made so far, counting the first.
    pub fn attempts(&self) -> u32 {
        match self.status {
            TaskStatus::Pending => self.retry_attempts,
            _ => self.retry_attempts + 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// An ordered list of steps that works towards one goal.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub goal: Goal,
    pub steps: Vec<PlanStep>,
    /// Index of the next step to run.
    pub current_step: usize,
    pub status: TaskStatus,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: Goal, steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::now_v7(),
            goal,
            steps,
            current_step: 0,
            status: TaskStatus::Pending,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn current(&self) -> Option<&PlanStep> {
        self.steps.get(self.current_step)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Move the cursor forward.  Only a terminal step can be passed.
    pub fn advance(&mut self) -> bool {
        match self.current() {
            Some(step) if step.status.is_terminal() => {
                self.current_step += 1;
                true
            }
            _ => false,
        }
    }

    /// Every step completed.  True for an empty plan.
    pub fn is_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == TaskStatus::Completed)
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count()
    }

    /// Fraction of completed steps in `[0, 1]`; 1.0 for an empty plan.
    pub fn get_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 1.0;
        }
        self.completed_steps() as f64 / self.steps.len() as f64
    }

    /// Metadata string, e.g. `previous_plan_id`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
