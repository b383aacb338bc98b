//! The agent: state machine, tool registry and message dispatcher.
//!
//! An [`Agent`] owns its tools and message handlers, records what it does in
//! its memory and in the shared [`Monitor`], and optionally talks to other
//! agents over a [`Channel`] and pursues goals through a [`Planner`].
//!
//! ```text
//! Initializing ─► Idle ◄─► { Planning | Executing | Communicating }
//!                  │
//!                  └─► Stopping ─► Stopped
//! ```
//!
//! Operations may overlap (the channel dispatches on several workers).  The
//! agent counts operations in flight and returns to `Idle` when the last one
//! returns; a failure moves it to `Error` until then.  Once stopped, the
//! agent stays stopped.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use agentkit_kernel::{Channel, EventType, Message, Monitor, subscriber};
use agentkit_store::{InMemoryStorage, Memory, WorkingMemory};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::goal::Goal;
use crate::planner::{ExecutionContext, PlanOutcome, Planner, ToolInvoker};
use crate::tool::{Params, Tool, ToolOutput, invoke_tool};

/// Memory category holding every message the agent sent or received.
pub const MESSAGES_CATEGORY: &str = "messages";

/// Memory category holding a record of every tool execution.
pub const TOOL_EXECUTIONS_CATEGORY: &str = "tool_executions";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Idle,
    Planning,
    Executing,
    Communicating,
    Stopping,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Communicating => "communicating",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// `Stopping` or `Stopped`.
    pub fn is_shut_down(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Handles messages of one intent.  `Ok(Some(reply))` is sent back by the
/// dispatcher when the agent is subscribed to a channel.
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Message>>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and creates an [`Agent`].
pub struct AgentBuilder {
    id: String,
    name: Option<String>,
    description: String,
    channel: Option<Arc<dyn Channel>>,
    monitor: Option<Monitor>,
    memory: Option<Arc<dyn Memory>>,
    planner: Option<Arc<dyn Planner>>,
}

impl AgentBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            channel: None,
            monitor: None,
            memory: None,
            planner: None,
        }
    }

    /// Display name; defaults to the id.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Shared event log; a private one is created otherwise.
    pub fn monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Defaults to a [`WorkingMemory`] over [`InMemoryStorage`].
    pub fn memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn build(self) -> Agent {
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(WorkingMemory::new(Arc::new(InMemoryStorage::new()))));
        let agent = Agent {
            inner: Arc::new(AgentInner {
                name: self.name.unwrap_or_else(|| self.id.clone()),
                id: self.id,
                description: self.description,
                lifecycle: Mutex::new(Lifecycle {
                    state: AgentState::Initializing,
                    active: 0,
                }),
                tools: DashMap::new(),
                handlers: DashMap::new(),
                memory,
                channel: self.channel,
                monitor: self.monitor.unwrap_or_default(),
                planner: self.planner,
            }),
        };

        agent.emit(
            EventType::Created,
            json!({"name": agent.inner.name, "description": agent.inner.description}),
        );
        agent.set_state(AgentState::Idle);
        info!(agent_id = %agent.id(), "agent created");
        agent
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// State plus the number of operations in flight.
#[derive(Debug)]
struct Lifecycle {
    state: AgentState,
    active: usize,
}

struct AgentInner {
    id: String,
    name: String,
    description: String,
    lifecycle: Mutex<Lifecycle>,
    tools: DashMap<String, Arc<dyn Tool>>,
    handlers: DashMap<String, MessageHandler>,
    memory: Arc<dyn Memory>,
    channel: Option<Arc<dyn Channel>>,
    monitor: Monitor,
    planner: Option<Arc<dyn Planner>>,
}

/// An autonomous actor.  Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Non-owning handle to an [`Agent`].
///
/// Handlers and callbacks stored inside an agent hold this instead of an
/// `Agent` clone, so they do not keep the agent alive.
#[derive(Clone)]
pub struct WeakAgent {
    inner: Weak<AgentInner>,
}

impl WeakAgent {
    /// The agent, if it still exists.
    pub fn upgrade(&self) -> Option<Agent> {
        self.inner.upgrade().map(|inner| Agent { inner })
    }
}

impl fmt::Debug for WeakAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakAgent")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl Agent {
    pub fn builder(id: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(id)
    }

    pub fn downgrade(&self) -> WeakAgent {
        WeakAgent {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn monitor(&self) -> &Monitor {
        &self.inner.monitor
    }

    pub fn memory(&self) -> Arc<dyn Memory> {
        Arc::clone(&self.inner.memory)
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.channel.clone()
    }

    pub fn planner(&self) -> Option<Arc<dyn Planner>> {
        self.inner.planner.clone()
    }

    // -- state ----------------------------------------------------------------

    pub fn state(&self) -> AgentState {
        self.lifecycle().state
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: AgentState) {
        self.lifecycle().state = next;
    }

    /// Begin an operation in state `next`.  Returns `false`, and changes
    /// nothing, when the agent is shut down.
    fn enter(&self, next: AgentState) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state.is_shut_down() {
            return false;
        }
        lifecycle.active += 1;
        lifecycle.state = next;
        true
    }

    /// Change the state of an operation already in flight.
    fn switch(&self, next: AgentState) {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.state.is_shut_down() {
            lifecycle.state = next;
        }
    }

    fn mark_error(&self) {
        self.switch(AgentState::Error);
    }

    /// End an operation begun by [`Agent::enter`].  The last one to finish
    /// returns the agent to `Idle`.
    fn restore(&self, entered: bool) {
        if !entered {
            return;
        }
        let mut lifecycle = self.lifecycle();
        lifecycle.active = lifecycle.active.saturating_sub(1);
        if lifecycle.active == 0 && !lifecycle.state.is_shut_down() {
            lifecycle.state = AgentState::Idle;
        }
    }

    fn emit(&self, event_type: EventType, data: Value) {
        self.inner.monitor.log_event(&self.inner.id, event_type, data);
    }

    async fn remember(&self, category: &str, key: &str, value: Value) {
        if let Err(e) = self.inner.memory.add(category, key, value).await {
            warn!(agent_id = %self.inner.id, category, error = %e, "failed to record in memory");
        }
    }

    async fn remember_message(&self, message: &Message) {
        match serde_json::to_value(message) {
            Ok(value) => {
                self.remember(MESSAGES_CATEGORY, &message.message_id.to_string(), value)
                    .await;
            }
            Err(e) => warn!(agent_id = %self.inner.id, error = %e, "failed to encode message"),
        }
    }

    // -- registration ---------------------------------------------------------

    /// Register a tool, replacing any tool with the same name.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        let params: Vec<Value> = tool.parameters().iter().map(|p| p.describe()).collect();
        if self.inner.tools.insert(name.clone(), tool).is_some() {
            debug!(agent_id = %self.inner.id, tool = %name, "tool replaced");
        }
        self.emit(
            EventType::ToolRegistered,
            json!({"tool_name": name, "parameters": params}),
        );
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.inner.tools.remove(name).is_some()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.inner.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tools.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Register the handler for `intent`, replacing any existing one.
    pub fn register_message_handler(&self, intent: impl Into<String>, handler: MessageHandler) {
        let intent = intent.into();
        self.inner.handlers.insert(intent.clone(), handler);
        self.emit(EventType::HandlerRegistered, json!({"intent": intent}));
    }

    /// Intents with a handler, sorted.
    pub fn handled_intents(&self) -> Vec<String> {
        let mut intents: Vec<String> =
            self.inner.handlers.iter().map(|h| h.key().clone()).collect();
        intents.sort();
        intents
    }

    // -- lifecycle ------------------------------------------------------------

    /// Subscribe to the channel under this agent's id.
    ///
    /// Delivered messages are dispatched through
    /// [`Agent::process_message`]; replies are sent to their recipients.
    pub async fn start(&self) -> Result<()> {
        if self.state().is_shut_down() {
            return Err(AgentError::AgentStopped {
                agent_id: self.inner.id.clone(),
            });
        }

        if let Some(channel) = &self.inner.channel {
            let weak: Weak<AgentInner> = Arc::downgrade(&self.inner);
            let callback = subscriber(move |message: Message| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    let agent = Agent { inner };
                    if let Some(reply) = agent.process_message(message).await {
                        if !reply.recipients.is_empty() {
                            // `process_message` already logged the reply as sent.
                            agent.publish(reply, false).await.map_err(|e| e.to_string())?;
                        }
                    }
                    Ok(())
                }
            });
            channel.subscribe(&self.inner.id, callback).await?;
        }

        self.set_state(AgentState::Idle);
        info!(agent_id = %self.inner.id, "agent started");
        self.emit(EventType::Started, json!({}));
        Ok(())
    }

    /// Unsubscribe from the channel and stop for good.  Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == AgentState::Stopped {
            return Ok(());
        }
        self.set_state(AgentState::Stopping);

        let result = match &self.inner.channel {
            Some(channel) => channel.unsubscribe(&self.inner.id).await,
            None => Ok(()),
        };

        self.set_state(AgentState::Stopped);
        info!(agent_id = %self.inner.id, "agent stopped");
        self.emit(EventType::Stopped, json!({}));
        result.map_err(AgentError::from)
    }

    // -- messaging ------------------------------------------------------------

    /// Dispatch `message` to the handler registered for its intent.
    ///
    /// Returns the handler's reply, if any.  A stopped agent, a missing
    /// handler and a failing handler all yield `None`.
    pub async fn process_message(&self, message: Message) -> Option<Message> {
        let agent_id = &self.inner.id;
        if self.state().is_shut_down() {
            debug!(agent_id = %agent_id, intent = %message.intent, "agent stopped, ignoring message");
            return None;
        }

        let Some(handler) = self
            .inner
            .handlers
            .get(&message.intent)
            .map(|h| Arc::clone(h.value()))
        else {
            warn!(
                agent_id = %agent_id,
                sender = %message.sender,
                intent = %message.intent,
                "no handler registered for intent"
            );
            self.emit(
                EventType::Error,
                json!({
                    "kind": "handler_missing",
                    "intent": message.intent,
                    "sender": message.sender,
                    "message_id": message.message_id,
                }),
            );
            return None;
        };

        let entered = self.enter(AgentState::Communicating);
        self.emit(
            EventType::MessageReceived,
            json!({
                "message_id": message.message_id,
                "sender": message.sender,
                "intent": message.intent,
            }),
        );
        self.remember_message(&message).await;

        let message_id = message.message_id;
        let intent = message.intent.clone();
        let reply = match AssertUnwindSafe(handler(message)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.handler_failed(&intent, message_id, &e.to_string());
                None
            }
            Err(_) => {
                self.handler_failed(&intent, message_id, "handler panicked");
                None
            }
        };

        if let Some(reply) = &reply {
            self.emit(
                EventType::MessageSent,
                json!({
                    "message_id": reply.message_id,
                    "intent": reply.intent,
                    "recipients": reply.recipients,
                    "reply_to": reply.reply_to,
                }),
            );
        }
        self.restore(entered);
        reply
    }

    fn handler_failed(&self, intent: &str, message_id: Uuid, reason: &str) {
        self.mark_error();
        error!(agent_id = %self.inner.id, intent, error = %reason, "message handler failed");
        self.emit(
            EventType::Error,
            json!({
                "kind": "handler_failed",
                "intent": intent,
                "message_id": message_id,
                "error": reason,
            }),
        );
    }

    /// Send a new message from this agent to `recipient`.
    pub async fn send_message(
        &self,
        recipient: impl Into<String>,
        intent: impl Into<String>,
        content: Value,
    ) -> Result<Uuid> {
        let message = Message::new(self.inner.id.clone(), intent, content).to(recipient);
        self.send(message).await
    }

    /// Publish `message` to each of its recipients.
    pub async fn send(&self, message: Message) -> Result<Uuid> {
        self.publish(message, true).await
    }

    async fn publish(&self, message: Message, log_sent: bool) -> Result<Uuid> {
        let Some(channel) = self.inner.channel.clone() else {
            return Err(AgentError::NoChannel {
                agent_id: self.inner.id.clone(),
            });
        };
        if message.recipients.is_empty() {
            return Err(AgentError::InvalidMessage {
                reason: format!("message {} has no recipients", message.message_id),
            });
        }

        let entered = self.enter(AgentState::Communicating);
        self.remember_message(&message).await;
        if log_sent {
            self.emit(
                EventType::MessageSent,
                json!({
                    "message_id": message.message_id,
                    "intent": message.intent,
                    "recipients": message.recipients,
                }),
            );
        }

        for recipient in &message.recipients {
            if let Err(e) = channel.publish(recipient, message.clone()).await {
                self.mark_error();
                error!(agent_id = %self.inner.id, recipient = %recipient, error = %e, "publish failed");
                self.emit(
                    EventType::Error,
                    json!({"kind": "publish_failed", "recipient": recipient, "error": e.to_string()}),
                );
                self.restore(entered);
                return Err(e.into());
            }
        }

        debug!(
            agent_id = %self.inner.id,
            message_id = %message.message_id,
            recipients = message.recipients.len(),
            "message sent"
        );
        self.restore(entered);
        Ok(message.message_id)
    }

    // -- tools ----------------------------------------------------------------

    /// Run a registered tool.
    ///
    /// Never fails: an unknown tool or a failing call yields an error
    /// [`ToolOutput`].
    pub async fn execute_tool(&self, name: &str, params: Params) -> ToolOutput {
        let agent_id = &self.inner.id;
        let Some(tool) = self.inner.tools.get(name).map(|t| Arc::clone(t.value())) else {
            warn!(agent_id = %agent_id, tool = %name, "tool not found");
            return ToolOutput::error(
                AgentError::ToolNotFound {
                    tool_name: name.to_owned(),
                }
                .to_string(),
            );
        };

        let entered = self.enter(AgentState::Executing);
        self.emit(
            EventType::ToolStarted,
            json!({"tool_name": name, "parameters": params}),
        );
        debug!(agent_id = %agent_id, tool = %name, "executing tool");

        let started = Instant::now();
        let output = invoke_tool(tool.as_ref(), params.clone()).await;
        let execution_time = started.elapsed().as_secs_f64();

        if output.is_error() {
            self.mark_error();
            warn!(
                agent_id = %agent_id,
                tool = %name,
                error = output.message.as_deref().unwrap_or_default(),
                "tool returned an error"
            );
        }

        let record = json!({
            "tool_name": name,
            "parameters": params,
            "result": output,
            "execution_time": execution_time,
            "timestamp": Utc::now(),
        });
        self.remember(TOOL_EXECUTIONS_CATEGORY, &Uuid::now_v7().to_string(), record)
            .await;

        self.emit(
            EventType::ToolCompleted,
            json!({
                "tool_name": name,
                "execution_time": execution_time,
                "status": output.status.as_str(),
            }),
        );
        self.restore(entered);
        output
    }

    // -- goals ----------------------------------------------------------------

    /// Plan for `goal` with the attached planner, then execute the plan
    /// using this agent's tools.
    pub async fn pursue_goal(&self, goal: Goal) -> Result<PlanOutcome> {
        let Some(planner) = self.inner.planner.clone() else {
            return Err(AgentError::NoPlanner {
                agent_id: self.inner.id.clone(),
            });
        };

        let entered = self.enter(AgentState::Planning);
        let plan = match planner.create_plan(goal).await {
            Ok(plan) => plan,
            Err(e) => {
                self.mark_error();
                error!(agent_id = %self.inner.id, error = %e, "planning failed");
                self.emit(
                    EventType::Error,
                    json!({"kind": "planning_failed", "error": e.to_string()}),
                );
                self.restore(entered);
                return Err(e);
            }
        };

        self.switch(AgentState::Executing);
        let ctx = ExecutionContext::new().with_invoker(Arc::new(self.clone()));
        let outcome = planner.execute_plan_with_replanning(plan, &ctx).await;
        if outcome.is_error() {
            self.mark_error();
        }
        self.restore(entered);
        Ok(outcome)
    }

    /// Metrics derived from this agent's events.
    pub fn metrics(&self) -> agentkit_kernel::AgentMetrics {
        self.inner.monitor.get_agent_metrics(&self.inner.id)
    }
}

#[async_trait]
impl ToolInvoker for Agent {
    async fn invoke(&self, tool_name: &str, params: Params) -> ToolOutput {
        self.execute_tool(tool_name, params).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{FnTool, ParamSpec, ParamType};
    use agentkit_kernel::EventFilter;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(
            FnTool::new("echo", "echo text", |p: Params| async move {
                Ok(p.get("text").cloned().unwrap_or(Value::Null))
            })
            .with_param(ParamSpec::required("text", ParamType::String)),
        )
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn new_agent_is_idle() {
        let agent = Agent::builder("a1").name("Alpha").build();
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.name(), "Alpha");
        let created = agent
            .monitor()
            .get_events(&EventFilter::agent("a1").of_type(EventType::Created));
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn execute_tool_records_and_reports() {
        let agent = Agent::builder("a1").build();
        agent.register_tool(echo_tool());

        let out = agent.execute_tool("echo", params(json!({"text": "hi"}))).await;
        assert!(out.is_success());
        assert_eq!(out.value, json!("hi"));
        assert_eq!(agent.state(), AgentState::Idle);

        let stored = agent
            .memory()
            .search("echo", Some(TOOL_EXECUTIONS_CATEGORY), None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value["result"]["value"], json!("hi"));

        let completed = agent
            .monitor()
            .get_events(&EventFilter::agent("a1").of_type(EventType::ToolCompleted));
        assert_eq!(completed[0].data["status"], json!("success"));
        assert!(completed[0].data["execution_time"].is_f64());
    }

    #[tokio::test]
    async fn unknown_tool_is_error_output() {
        let agent = Agent::builder("a1").build();
        let out = agent.execute_tool("nope", Params::new()).await;
        assert!(out.is_error());
        assert_eq!(out.message.as_deref(), Some("Tool not found: nope"));
    }

    #[tokio::test]
    async fn failing_tool_restores_state() {
        let agent = Agent::builder("a1").build();
        agent.register_tool(echo_tool());
        let out = agent.execute_tool("echo", Params::new()).await;
        assert!(out.is_error());
        assert_eq!(agent.state(), AgentState::Idle);
    }

    fn sleep_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new("sleep", "sleep for ms", |p: Params| async move {
            let ms = p.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(json!(ms))
        }))
    }

    #[tokio::test]
    async fn overlapping_tools_return_to_idle() {
        let agent = Agent::builder("a1").build();
        agent.register_tool(sleep_tool());

        let long = agent.execute_tool("sleep", params(json!({"ms": 100})));
        let short = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let out = agent.execute_tool("sleep", params(json!({"ms": 20}))).await;
            // The longer call is still running.
            assert_eq!(agent.state(), AgentState::Executing);
            out
        };
        let (long, short) = tokio::join!(long, short);
        assert!(long.is_success());
        assert!(short.is_success());
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn overlapping_failure_still_returns_to_idle() {
        let agent = Agent::builder("a1").build();
        agent.register_tool(sleep_tool());
        agent.register_tool(echo_tool());

        let (slow, bad) = tokio::join!(
            agent.execute_tool("sleep", params(json!({"ms": 50}))),
            agent.execute_tool("echo", Params::new()),
        );
        assert!(slow.is_success());
        assert!(bad.is_error());
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_agent_alive() {
        let agent = Agent::builder("a1").build();
        let weak = agent.downgrade();
        agent.register_message_handler(
            "ping",
            handler({
                let weak = weak.clone();
                move |m: Message| {
                    let weak = weak.clone();
                    async move {
                        let Some(me) = weak.upgrade() else {
                            return Ok(None);
                        };
                        Ok(Some(m.reply(me.id(), "pong", json!(null))))
                    }
                }
            }),
        );
        let reply = agent
            .process_message(Message::new("b", "ping", json!(null)))
            .await
            .unwrap();
        assert_eq!(reply.intent, "pong");

        drop(agent);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn handler_reply_is_returned() {
        let agent = Agent::builder("a1").build();
        agent.register_message_handler(
            "ping",
            handler(|m: Message| async move { Ok(Some(m.reply("a1", "pong", json!(null)))) }),
        );

        let msg = Message::new("b", "ping", json!({}));
        let reply = agent.process_message(msg.clone()).await.unwrap();
        assert_eq!(reply.intent, "pong");
        assert_eq!(reply.reply_to, Some(msg.message_id));
        assert_eq!(reply.recipients, vec!["b".to_owned()]);

        let stored = agent
            .memory()
            .get(MESSAGES_CATEGORY, &msg.message_id.to_string())
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn missing_handler_is_logged_as_error_event() {
        let agent = Agent::builder("a1").build();
        let reply = agent
            .process_message(Message::new("b", "unknown", json!(null)))
            .await;
        assert!(reply.is_none());

        let errors = agent
            .monitor()
            .get_events(&EventFilter::agent("a1").of_type(EventType::Error));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["kind"], json!("handler_missing"));
    }

    #[tokio::test]
    async fn failing_handler_yields_none() {
        let agent = Agent::builder("a1").build();
        agent.register_message_handler(
            "bad",
            handler(|_| async { Err(AgentError::Internal("nope".into())) }),
        );
        assert!(
            agent
                .process_message(Message::new("b", "bad", json!(null)))
                .await
                .is_none()
        );
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.metrics().errors, 1);
    }

    #[tokio::test]
    async fn send_without_channel_fails() {
        let agent = Agent::builder("a1").build();
        let err = agent.send_message("b", "hi", json!(null)).await.unwrap_err();
        assert!(matches!(err, AgentError::NoChannel { .. }));
    }

    #[tokio::test]
    async fn pursue_goal_without_planner_fails() {
        let agent = Agent::builder("a1").build();
        let err = agent.pursue_goal(Goal::new("g", "")).await.unwrap_err();
        assert!(matches!(err, AgentError::NoPlanner { .. }));
    }

    #[tokio::test]
    async fn stopped_agent_ignores_messages_and_cannot_restart() {
        let agent = Agent::builder("a1").build();
        agent.register_message_handler("ping", handler(|_| async { Ok(None) }));
        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(
            agent
                .process_message(Message::new("b", "ping", json!(null)))
                .await
                .is_none()
        );
        assert!(matches!(
            agent.start().await,
            Err(AgentError::AgentStopped { .. })
        ));
        // A second stop is a no-op.
        agent.stop().await.unwrap();
    }

    #[test]
    fn state_display() {
        assert_eq!(AgentState::Communicating.to_string(), "communicating");
        assert!(AgentState::Stopping.is_shut_down());
        assert!(!AgentState::Error.is_shut_down());
    }
}
