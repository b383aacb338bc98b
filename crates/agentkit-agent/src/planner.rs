//! Goal planning and plan execution.
//!
//! A [`Planner`] turns a [`Goal`] into a [`Plan`] and drives it to a
//! terminal state.  Execution is shared by every planner through
//! [`PlanRunner`]:
//!
//! 1. Steps run strictly in cursor order.
//! 2. A failed step with retry budget left is reset to pending and retried
//!    immediately, without advancing the cursor.
//! 3. A step that exhausts its retries fails the plan and its goal, unless
//!    [`Planner::execute_plan_with_replanning`] decides to replace the plan.
//!
//! Two planners are provided:
//!
//! - [`HierarchicalPlanner`] -- one `process_subgoal` tool step per direct
//!   subgoal.
//! - [`GoalOrientedPlanner`] -- uniform-cost search over a library of
//!   actions with preconditions and effects, falling back to a fixed
//!   four-step template.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use agentkit_kernel::{EventType, Monitor};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::goal::{Goal, Plan, PlanStep, StepAction, StepCallable, TaskStatus, step_callable};
use crate::repository::{InMemoryPlanRepository, PlanRepository};
use crate::tool::{Params, ToolOutput, ToolStatus};

/// Tool name used by [`HierarchicalPlanner`] steps.
pub const PROCESS_SUBGOAL: &str = "process_subgoal";

/// Fallback steps of [`GoalOrientedPlanner`], in order.
pub const TEMPLATE_STEPS: [&str; 4] = [
    "analyze_goal",
    "gather_information",
    "execute_actions",
    "verify_results",
];

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Runs named tools on behalf of a plan.  Implemented by [`crate::Agent`].
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, params: Params) -> ToolOutput;
}

/// Everything a plan needs from its caller while running.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    /// Resolves [`StepAction::Tool`] steps.  Tool steps fail without one.
    pub invoker: Option<Arc<dyn ToolInvoker>>,
    /// Merged under every step's parameters; step parameters win.
    pub variables: Params,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("has_invoker", &self.invoker.is_some())
            .field("variables", &self.variables)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Limits applied while executing plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Replan only while progress is below this fraction.
    pub replan_threshold: f64,

    /// Maximum number of replacement plans per execution.
    pub max_replan_depth: u32,

    /// Retry budget given to generated steps.
    pub default_retry_count: u32,

    /// Wall-clock budget for one execution, checked between steps.
    /// Serialized as seconds.
    #[serde(with = "opt_secs")]
    pub max_execution_time: Option<Duration>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            replan_threshold: 0.5,
            max_replan_depth: 3,
            default_retry_count: 3,
            max_execution_time: None,
        }
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of executing a plan to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub status: ToolStatus,
    /// The plan that finished; after replanning, the last replacement.
    pub plan_id: Uuid,
    pub goal_id: Uuid,
    pub message: String,
    /// Step whose failure ended the plan.
    #[serde(default)]
    pub failed_step: Option<Uuid>,
    /// Results of completed steps, in step order.
    #[serde(default)]
    pub results: Vec<Value>,
    /// Replacement plans created along the way.
    #[serde(default)]
    pub replans: u32,
}

impl PlanOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

// ---------------------------------------------------------------------------
// Plan runner
// ---------------------------------------------------------------------------

/// Why a pass over the plan stopped.
enum StepRun {
    Finished,
    StepFailed { step_id: Uuid, error: String },
    TimedOut,
}

/// Shared plan execution machinery.
///
/// Owns the repository the plans are persisted to and, optionally, the
/// monitor that receives plan and goal events.
pub struct PlanRunner {
    repository: Arc<dyn PlanRepository>,
    monitor: Option<Monitor>,
    owner: String,
    config: PlannerConfig,
}

impl PlanRunner {
    /// A runner with an in-memory repository and no monitor.
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            repository: Arc::new(InMemoryPlanRepository::new()),
            monitor: None,
            owner: "planner".to_owned(),
            config,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn PlanRepository>) -> Self {
        self.repository = repository;
        self
    }

    /// Log plan and goal events to `monitor` under `owner`.
    pub fn with_monitor(mut self, monitor: Monitor, owner: impl Into<String>) -> Self {
        self.monitor = Some(monitor);
        self.owner = owner.into();
        self
    }

    pub fn repository(&self) -> Arc<dyn PlanRepository> {
        Arc::clone(&self.repository)
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    fn emit(&self, event_type: EventType, data: Value) {
        if let Some(monitor) = &self.monitor {
            monitor.log_event(&self.owner, event_type, data);
        }
    }

    /// Persist a freshly created plan and its goal, emitting creation events.
    pub async fn record_new_plan(&self, plan: &Plan) -> Result<()> {
        if self.repository.get_goal(plan.goal.id).await?.is_none() {
            self.emit(
                EventType::GoalCreated,
                json!({
                    "goal_id": plan.goal.id,
                    "name": plan.goal.name,
                    "priority": plan.goal.priority,
                }),
            );
        }
        self.repository.save_goal(&plan.goal).await?;
        self.repository.save_plan(plan).await?;

        info!(
            plan_id = %plan.id,
            goal = %plan.goal.name,
            steps = plan.steps.len(),
            "plan created"
        );
        self.emit(
            EventType::PlanCreated,
            json!({
                "plan_id": plan.id,
                "goal_id": plan.goal.id,
                "steps": plan.steps.len(),
                "metadata": plan.metadata,
            }),
        );
        Ok(())
    }

    async fn persist(&self, plan: &Plan) {
        if let Err(e) = self.repository.save_plan(plan).await {
            warn!(plan_id = %plan.id, error = %e, "failed to persist plan");
        }
        if let Err(e) = self.repository.save_goal(&plan.goal).await {
            warn!(goal_id = %plan.goal.id, error = %e, "failed to persist goal");
        }
    }

    async fn begin(&self, plan: &mut Plan) {
        plan.status = TaskStatus::InProgress;
        plan.goal.start();
        self.persist(plan).await;
        debug!(plan_id = %plan.id, "plan started");
        self.emit(
            EventType::PlanStarted,
            json!({"plan_id": plan.id, "goal_id": plan.goal.id}),
        );
    }

    /// Run steps from the cursor until the plan finishes or a step fails
    /// for good.
    async fn drive(
        &self,
        plan: &mut Plan,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> StepRun {
        while plan.current_step < plan.steps.len() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return StepRun::TimedOut;
            }

            let index = plan.current_step;
            {
                let step = &mut plan.steps[index];
                match step.status {
                    TaskStatus::Completed => {
                        plan.current_step += 1;
                        continue;
                    }
                    TaskStatus::Failed if !step.can_retry() => {
                        return StepRun::StepFailed {
                            step_id: step.id,
                            error: step.error.clone().unwrap_or_default(),
                        };
                    }
                    TaskStatus::Failed => step.retry_attempts += 1,
                    TaskStatus::Pending | TaskStatus::InProgress => {}
                }
                step.status = TaskStatus::InProgress;
                debug!(
                    plan_id = %plan.id,
                    step = %step.name(),
                    attempt = step.retry_attempts + 1,
                    "running step"
                );
            }

            let outcome = self.run_step(&plan.steps[index], ctx).await;

            let step = &mut plan.steps[index];
            match outcome {
                Ok(value) => {
                    step.status = TaskStatus::Completed;
                    step.result = Some(value);
                    step.error = None;
                    plan.advance();
                }
                Err(error) => {
                    step.status = TaskStatus::Failed;
                    step.error = Some(error.clone());
                    if step.can_retry() {
                        step.retry_attempts += 1;
                        step.status = TaskStatus::Pending;
                        warn!(
                            step = %step.name(),
                            retry = step.retry_attempts,
                            of = step.retry_count,
                            error = %error,
                            "step failed, retrying"
                        );
                        continue;
                    }
                    warn!(
                        step = %step.name(),
                        attempts = step.retry_attempts + 1,
                        error = %error,
                        "step failed, retries exhausted"
                    );
                    return StepRun::StepFailed {
                        step_id: step.id,
                        error,
                    };
                }
            }
        }
        StepRun::Finished
    }

    async fn run_step(
        &self,
        step: &PlanStep,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, String> {
        let mut params = ctx.variables.clone();
        params.extend(step.parameters.clone());

        let call = async {
            match &step.action {
                StepAction::Tool(name) => {
                    let Some(invoker) = &ctx.invoker else {
                        return Err(format!("no tool invoker for tool step `{name}`"));
                    };
                    let output = invoker.invoke(name, params).await;
                    if output.is_success() {
                        Ok(output.value)
                    } else {
                        Err(output
                            .message
                            .unwrap_or_else(|| format!("tool `{name}` failed")))
                    }
                }
                StepAction::Callable { func, .. } => func(params).await.map_err(|e| e.to_string()),
            }
        };
        let call = AssertUnwindSafe(call).catch_unwind();

        let result = match step.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(AgentError::Timeout {
                        operation: step.name().to_owned(),
                        timeout: limit,
                    }
                    .to_string());
                }
            },
            None => call.await,
        };
        result.unwrap_or_else(|_| Err(format!("step `{}` panicked", step.name())))
    }

    /// Mark `plan` as superseded by `replacement`.
    async fn retire(&self, plan: &mut Plan, replacement: Uuid, reason: &str) {
        plan.status = TaskStatus::Failed;
        plan.metadata
            .insert("replaced_by".into(), json!(replacement.to_string()));
        if let Err(e) = self.repository.save_plan(plan).await {
            warn!(plan_id = %plan.id, error = %e, "failed to persist plan");
        }
        self.emit(
            EventType::PlanFailed,
            json!({
                "plan_id": plan.id,
                "goal_id": plan.goal.id,
                "error": reason,
                "replaced_by": replacement,
            }),
        );
    }

    async fn finish(
        &self,
        mut plan: Plan,
        failure: Option<(Option<Uuid>, String)>,
        replans: u32,
    ) -> PlanOutcome {
        let results = plan.steps.iter().filter_map(|s| s.result.clone()).collect();

        match failure {
            None => {
                plan.status = TaskStatus::Completed;
                plan.goal.complete();
                self.persist(&plan).await;
                info!(plan_id = %plan.id, goal = %plan.goal.name, replans, "plan completed");
                self.emit(
                    EventType::PlanCompleted,
                    json!({
                        "plan_id": plan.id,
                        "goal_id": plan.goal.id,
                        "steps": plan.steps.len(),
                        "replans": replans,
                    }),
                );
                self.emit(
                    EventType::GoalCompleted,
                    json!({"goal_id": plan.goal.id, "name": plan.goal.name}),
                );
                PlanOutcome {
                    status: ToolStatus::Success,
                    plan_id: plan.id,
                    goal_id: plan.goal.id,
                    message: format!("Plan for goal `{}` completed", plan.goal.name),
                    failed_step: None,
                    results,
                    replans,
                }
            }
            Some((failed_step, reason)) => {
                plan.status = TaskStatus::Failed;
                plan.goal.fail();
                self.persist(&plan).await;

                let message = match failed_step.and_then(|id| plan.step(id)) {
                    Some(step) => format!("Step {} ({}) failed: {reason}", step.id, step.name()),
                    None => reason,
                };
                warn!(plan_id = %plan.id, goal = %plan.goal.name, replans, "{message}");
                self.emit(
                    EventType::PlanFailed,
                    json!({
                        "plan_id": plan.id,
                        "goal_id": plan.goal.id,
                        "failed_step": failed_step,
                        "error": message,
                    }),
                );
                self.emit(
                    EventType::GoalFailed,
                    json!({"goal_id": plan.goal.id, "name": plan.goal.name}),
                );
                PlanOutcome {
                    status: ToolStatus::Error,
                    plan_id: plan.id,
                    goal_id: plan.goal.id,
                    message,
                    failed_step,
                    results,
                    replans,
                }
            }
        }
    }

    fn deadline(&self, started: Instant) -> Option<Instant> {
        self.config.max_execution_time.map(|limit| started + limit)
    }

    /// Execute `plan` without replanning.
    pub async fn execute(&self, mut plan: Plan, ctx: &ExecutionContext) -> PlanOutcome {
        let deadline = self.deadline(Instant::now());
        self.begin(&mut plan).await;
        let failure = match self.drive(&mut plan, ctx, deadline).await {
            StepRun::Finished => None,
            StepRun::StepFailed { step_id, error } => Some((Some(step_id), error)),
            StepRun::TimedOut => Some((None, "maximum execution time exceeded".to_owned())),
        };
        self.finish(plan, failure, 0).await
    }
}

// ---------------------------------------------------------------------------
// Planner trait
// ---------------------------------------------------------------------------

/// Builds plans for goals and executes them.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Build and persist a plan for `goal`.
    async fn create_plan(&self, goal: Goal) -> Result<Plan>;

    /// Execution machinery shared by all planners.
    fn runner(&self) -> &PlanRunner;

    fn repository(&self) -> Arc<dyn PlanRepository> {
        self.runner().repository()
    }

    /// Run `plan` to a terminal state.
    async fn execute_plan(&self, plan: Plan, ctx: &ExecutionContext) -> PlanOutcome {
        self.runner().execute(plan, ctx).await
    }

    /// Create a replacement for `previous`, tagged with where it came from.
    async fn replan(&self, previous: &Plan, reason: &str, depth: u32) -> Result<Plan> {
        let mut plan = self.create_plan(previous.goal.clone()).await?;
        plan.metadata
            .insert("previous_plan_id".into(), json!(previous.id.to_string()));
        plan.metadata.insert("replan_reason".into(), json!(reason));
        plan.metadata.insert("replan_depth".into(), json!(depth));
        self.repository().save_plan(&plan).await?;

        info!(
            previous_plan_id = %previous.id,
            plan_id = %plan.id,
            depth,
            reason = %reason,
            "replanned"
        );
        Ok(plan)
    }

    /// Like [`Planner::execute_plan`], but a step failure while progress is
    /// below `replan_threshold` swaps in a new plan, up to
    /// `max_replan_depth` times.
    async fn execute_plan_with_replanning(
        &self,
        plan: Plan,
        ctx: &ExecutionContext,
    ) -> PlanOutcome {
        let runner = self.runner();
        let config = runner.config().clone();
        let deadline = runner.deadline(Instant::now());

        let mut plan = plan;
        let mut depth = 0;
        runner.begin(&mut plan).await;

        loop {
            let (step_id, error) = match runner.drive(&mut plan, ctx, deadline).await {
                StepRun::Finished => return runner.finish(plan, None, depth).await,
                StepRun::TimedOut => {
                    let reason = "maximum execution time exceeded".to_owned();
                    return runner.finish(plan, Some((None, reason)), depth).await;
                }
                StepRun::StepFailed { step_id, error } => (step_id, error),
            };

            let progress = plan.get_progress();
            if progress < config.replan_threshold && depth < config.max_replan_depth {
                let reason = format!("step {step_id} failed: {error}");
                match self.replan(&plan, &reason, depth + 1).await {
                    Ok(mut replacement) => {
                        runner.retire(&mut plan, replacement.id, &reason).await;
                        depth += 1;
                        runner.begin(&mut replacement).await;
                        plan = replacement;
                        continue;
                    }
                    Err(e) => warn!(plan_id = %plan.id, error = %e, "replanning failed"),
                }
            } else {
                debug!(
                    progress,
                    depth,
                    threshold = config.replan_threshold,
                    "not replanning"
                );
            }
            return runner.finish(plan, Some((Some(step_id), error)), depth).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Hierarchical planner
// ---------------------------------------------------------------------------

/// One `process_subgoal` step per direct subgoal.
///
/// Nested subgoals are not expanded; the tool handling `process_subgoal` is
/// expected to recurse if it needs to.
pub struct HierarchicalPlanner {
    runner: PlanRunner,
}

impl HierarchicalPlanner {
    pub fn new(runner: PlanRunner) -> Self {
        Self { runner }
    }
}

impl Default for HierarchicalPlanner {
    fn default() -> Self {
        Self::new(PlanRunner::new(PlannerConfig::default()))
    }
}

#[async_trait]
impl Planner for HierarchicalPlanner {
    async fn create_plan(&self, goal: Goal) -> Result<Plan> {
        let retry_count = self.runner.config().default_retry_count;
        let steps = goal
            .subgoals
            .iter()
            .map(|sub| {
                PlanStep::tool(PROCESS_SUBGOAL)
                    .with_parameter("subgoal_id", json!(sub.id))
                    .with_parameter("name", json!(sub.name))
                    .with_parameter("description", json!(sub.description))
                    .with_parameter("priority", json!(sub.priority))
                    .with_expected_outcome(format!("subgoal `{}` achieved", sub.name))
                    .with_retry_count(retry_count)
            })
            .collect();

        let plan = Plan::new(goal, steps).with_metadata("planner", json!("hierarchical"));
        self.runner.record_new_plan(&plan).await?;
        Ok(plan)
    }

    fn runner(&self) -> &PlanRunner {
        &self.runner
    }
}

// ---------------------------------------------------------------------------
// Goal-oriented planner
// ---------------------------------------------------------------------------

/// An action the goal-oriented planner can chain.
#[derive(Clone)]
pub struct ActionSpec {
    pub callable: StepCallable,
    /// Facts that must hold before the action runs.
    pub preconditions: BTreeSet<String>,
    /// Facts that hold after it succeeds.
    pub effects: BTreeSet<String>,
    pub cost: f64,
}

impl ActionSpec {
    pub fn new(callable: StepCallable) -> Self {
        Self {
            callable,
            preconditions: BTreeSet::new(),
            effects: BTreeSet::new(),
            cost: 1.0,
        }
    }

    pub fn requires(mut self, fact: impl Into<String>) -> Self {
        self.preconditions.insert(fact.into());
        self
    }

    pub fn produces(mut self, fact: impl Into<String>) -> Self {
        self.effects.insert(fact.into());
        self
    }

    /// Negative costs are clamped to zero.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost.max(0.0);
        self
    }
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("preconditions", &self.preconditions)
            .field("effects", &self.effects)
            .field("cost", &self.cost)
            .finish()
    }
}

/// Search frontier entry; ordered so the cheapest pops first.
struct Node {
    cost: f64,
    state: BTreeSet<String>,
    path: Vec<String>,
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.path.len().cmp(&self.path.len()))
            .then_with(|| other.path.cmp(&self.path))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Node {}

/// Cheapest action sequence from `start` to a state containing `target`.
fn uniform_cost_search(
    start: &BTreeSet<String>,
    target: &BTreeSet<String>,
    actions: &BTreeMap<String, ActionSpec>,
    max_depth: usize,
) -> Option<(Vec<String>, f64)> {
    let mut frontier = BinaryHeap::new();
    let mut explored: HashSet<BTreeSet<String>> = HashSet::new();
    frontier.push(Node {
        cost: 0.0,
        state: start.clone(),
        path: Vec::new(),
    });

    while let Some(node) = frontier.pop() {
        if target.is_subset(&node.state) {
            return Some((node.path, node.cost));
        }
        if !explored.insert(node.state.clone()) || node.path.len() >= max_depth {
            continue;
        }
        for (name, spec) in actions {
            if !spec.preconditions.is_subset(&node.state) {
                continue;
            }
            let mut next: BTreeSet<String> = node.state.clone();
            next.extend(spec.effects.iter().cloned());
            if next == node.state || explored.contains(&next) {
                continue;
            }
            let mut path = node.path.clone();
            path.push(name.clone());
            frontier.push(Node {
                cost: node.cost + spec.cost,
                state: next,
                path,
            });
        }
    }
    None
}

/// Plans by searching a library of actions for the cheapest way to reach
/// the goal's conditions.
///
/// Successful action steps add their effects to the planner's world state,
/// so a replan after partial progress starts from where execution stopped.
pub struct GoalOrientedPlanner {
    runner: PlanRunner,
    actions: RwLock<BTreeMap<String, ActionSpec>>,
    world_state: Arc<RwLock<BTreeSet<String>>>,
    max_search_depth: usize,
}

impl GoalOrientedPlanner {
    pub fn new(runner: PlanRunner) -> Self {
        Self {
            runner,
            actions: RwLock::new(BTreeMap::new()),
            world_state: Arc::new(RwLock::new(BTreeSet::new())),
            max_search_depth: 8,
        }
    }

    pub fn with_max_search_depth(mut self, depth: usize) -> Self {
        self.max_search_depth = depth.max(1);
        self
    }

    /// Add or replace an action.
    pub fn register_action(&self, name: impl Into<String>, spec: ActionSpec) {
        let name = name.into();
        debug!(action = %name, cost = spec.cost, "action registered");
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, spec);
    }

    pub fn unregister_action(&self, name: &str) -> bool {
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Replace the facts currently known to hold.
    pub fn set_world_state<I, S>(&self, facts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.world_state.write().unwrap_or_else(PoisonError::into_inner);
        *state = facts.into_iter().map(Into::into).collect();
    }

    pub fn world_state(&self) -> BTreeSet<String> {
        self.world_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Step that runs `spec` and records its effects on success.
    fn action_step(&self, name: &str, spec: &ActionSpec, goal: &Goal) -> PlanStep {
        let world = Arc::clone(&self.world_state);
        let effects = spec.effects.clone();
        let inner = Arc::clone(&spec.callable);
        let func = step_callable(move |params| {
            let world = Arc::clone(&world);
            let effects = effects.clone();
            let inner = Arc::clone(&inner);
            async move {
                let value = inner(params).await?;
                world
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(effects);
                Ok(value)
            }
        });

        let expected = spec.effects.iter().cloned().collect::<Vec<_>>().join(", ");
        PlanStep::callable(name, func)
            .with_parameter("action", json!(name))
            .with_parameter("goal_id", json!(goal.id))
            .with_expected_outcome(expected)
            .with_retry_count(self.runner.config().default_retry_count)
    }

    fn template_steps(&self, goal: &Goal, actions: &BTreeMap<String, ActionSpec>) -> Vec<PlanStep> {
        let retry_count = self.runner.config().default_retry_count;
        TEMPLATE_STEPS
            .iter()
            .map(|name| match actions.get(*name) {
                Some(spec) => self.action_step(name, spec, goal),
                None => PlanStep::tool(*name)
                    .with_parameter("goal_id", json!(goal.id))
                    .with_parameter("goal_name", json!(goal.name))
                    .with_parameter("goal_description", json!(goal.description))
                    .with_retry_count(retry_count),
            })
            .collect()
    }
}

impl Default for GoalOrientedPlanner {
    fn default() -> Self {
        Self::new(PlanRunner::new(PlannerConfig::default()))
    }
}

#[async_trait]
impl Planner for GoalOrientedPlanner {
    async fn create_plan(&self, goal: Goal) -> Result<Plan> {
        let actions = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let start = self.world_state();

        let found = if goal.conditions.is_empty() || actions.is_empty() {
            None
        } else {
            uniform_cost_search(&start, &goal.conditions, &actions, self.max_search_depth)
        };

        let plan = match found {
            Some((path, cost)) => {
                let steps = path
                    .iter()
                    .filter_map(|name| actions.get(name).map(|spec| (name, spec)))
                    .map(|(name, spec)| self.action_step(name, spec, &goal))
                    .collect();
                Plan::new(goal, steps)
                    .with_metadata("planner", json!("goal_oriented"))
                    .with_metadata("strategy", json!("search"))
                    .with_metadata("estimated_cost", json!(cost))
            }
            None => {
                debug!(goal = %goal.name, "no action sequence found, using template");
                let steps = self.template_steps(&goal, &actions);
                Plan::new(goal, steps)
                    .with_metadata("planner", json!("goal_oriented"))
                    .with_metadata("strategy", json!("template"))
            }
        };

        self.runner.record_new_plan(&plan).await?;
        Ok(plan)
    }

    fn runner(&self) -> &PlanRunner {
        &self.runner
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
