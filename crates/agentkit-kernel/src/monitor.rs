//! Event log and derived metrics.
//!
//! The [`Monitor`] keeps an append-only, capacity-bounded ring buffer of
//! [`Event`]s (oldest evicted first) and fans every event out to listeners
//! through a [`tokio::sync::broadcast`] queue.  Each listener registered with
//! [`Monitor::add_listener`] runs on its own task, so listeners observe events
//! independently and in no particular order relative to each other.
//!
//! Metrics are recomputed by scanning the buffer on every call.  The buffer
//! is bounded, so this stays cheap; there is no incremental index.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Stopped,
    ToolRegistered,
    ToolStarted,
    ToolCompleted,
    HandlerRegistered,
    MessageReceived,
    MessageSent,
    PlanCreated,
    PlanStarted,
    PlanCompleted,
    PlanFailed,
    GoalCreated,
    GoalCompleted,
    GoalFailed,
    Error,
    Custom,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::ToolRegistered => "tool_registered",
            Self::ToolStarted => "tool_started",
            Self::ToolCompleted => "tool_completed",
            Self::HandlerRegistered => "handler_registered",
            Self::MessageReceived => "message_received",
            Self::MessageSent => "message_sent",
            Self::PlanCreated => "plan_created",
            Self::PlanStarted => "plan_started",
            Self::PlanCompleted => "plan_completed",
            Self::PlanFailed => "plan_failed",
            Self::GoalCreated => "goal_created",
            Self::GoalCompleted => "goal_completed",
            Self::GoalFailed => "goal_failed",
            Self::Error => "error",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the monitor's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// The agent (or subsystem) that produced the event.
    pub agent_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Selects a subset of the buffer in [`Monitor::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub agent_id: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        self.agent_id.as_deref().is_none_or(|id| event.agent_id == id)
            && self.event_type.is_none_or(|t| event.event_type == t)
            && self.since.is_none_or(|since| event.timestamp >= since)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregates for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub total_events: usize,
    pub event_counts: BTreeMap<EventType, usize>,
    pub tool_executions: usize,
    /// Mean `execution_time` (seconds) of completed tool calls.
    pub avg_tool_execution_time: f64,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub errors: usize,
    pub plans_completed: usize,
    pub plans_failed: usize,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Aggregates across every agent in the buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_events: usize,
    pub agent_count: usize,
    pub event_counts: BTreeMap<EventType, usize>,
    pub tool_executions: usize,
    pub avg_tool_execution_time: f64,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub errors: usize,
    pub plans_completed: usize,
    pub plans_failed: usize,
    pub buffer_capacity: usize,
}

/// Running totals shared by both metric views.
#[derive(Default)]
struct Tally {
    total: usize,
    counts: BTreeMap<EventType, usize>,
    tool_time_sum: f64,
    tool_time_samples: usize,
    agents: BTreeSet<String>,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl Tally {
    fn add(&mut self, event: &Event) {
        self.total += 1;
        *self.counts.entry(event.event_type).or_default() += 1;
        if event.event_type == EventType::ToolCompleted {
            if let Some(secs) = event.data.get("execution_time").and_then(Value::as_f64) {
                self.tool_time_sum += secs;
                self.tool_time_samples += 1;
            }
        }
        self.agents.insert(event.agent_id.clone());
        self.first = Some(self.first.map_or(event.timestamp, |t| t.min(event.timestamp)));
        self.last = Some(self.last.map_or(event.timestamp, |t| t.max(event.timestamp)));
    }

    fn count(&self, event_type: EventType) -> usize {
        self.counts.get(&event_type).copied().unwrap_or(0)
    }

    fn avg_tool_time(&self) -> f64 {
        if self.tool_time_samples == 0 {
            0.0
        } else {
            self.tool_time_sum / self.tool_time_samples as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Tuning for [`Monitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum number of events retained.
    pub capacity: usize,

    /// Per-listener backlog before a slow listener starts skipping events.
    pub listener_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            listener_buffer: 256,
        }
    }
}

/// Append-only event log with listener fan-out.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    capacity: usize,
    events: RwLock<VecDeque<Event>>,
    sender: broadcast::Sender<Arc<Event>>,
}

impl Monitor {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (sender, _) = broadcast::channel(config.listener_buffer.max(1));
        Self {
            inner: Arc::new(MonitorInner {
                capacity,
                events: RwLock::new(VecDeque::with_capacity(capacity)),
                sender,
            }),
        }
    }

    /// Append an event and notify listeners.
    ///
    /// `data` is stored as-is when it is a JSON object; any other value is
    /// wrapped as `{"value": data}`.
    pub fn log_event(&self, agent_id: &str, event_type: EventType, data: Value) -> Uuid {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };

        let event = Event {
            id: Uuid::now_v7(),
            agent_id: agent_id.to_owned(),
            event_type,
            timestamp: Utc::now(),
            data,
        };
        let id = event.id;

        {
            let mut events = self.write_events();
            while events.len() >= self.inner.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        tracing::trace!(agent_id = %agent_id, event_type = %event_type, "event logged");

        // No listeners is fine.
        let _ = self.inner.sender.send(Arc::new(event));
        id
    }

    /// A receiver for every future event.  Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Run `listener` for every future event on a dedicated task.
    ///
    /// Must be called from within a tokio runtime.  Abort the returned handle
    /// to detach the listener.
    pub fn add_listener<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Event>) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "monitor listener lagged; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of listener receivers currently attached.
    pub fn listener_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Events matching `filter`, oldest first.
    pub fn get_events(&self, filter: &EventFilter) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .read_events()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.read_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Drop every buffered event.
    pub fn clear(&self) {
        self.write_events().clear();
    }

    /// Aggregates for one agent.
    pub fn get_agent_metrics(&self, agent_id: &str) -> AgentMetrics {
        let mut tally = Tally::default();
        for event in self.read_events().iter().filter(|e| e.agent_id == agent_id) {
            tally.add(event);
        }

        AgentMetrics {
            agent_id: agent_id.to_owned(),
            total_events: tally.total,
            tool_executions: tally.count(EventType::ToolCompleted),
            avg_tool_execution_time: tally.avg_tool_time(),
            messages_received: tally.count(EventType::MessageReceived),
            messages_sent: tally.count(EventType::MessageSent),
            errors: tally.count(EventType::Error),
            plans_completed: tally.count(EventType::PlanCompleted),
            plans_failed: tally.count(EventType::PlanFailed),
            first_seen: tally.first,
            last_seen: tally.last,
            event_counts: tally.counts,
        }
    }

    /// Aggregates across all agents.
    pub fn get_system_metrics(&self) -> SystemMetrics {
        let mut tally = Tally::default();
        for event in self.read_events().iter() {
            tally.add(event);
        }

        SystemMetrics {
            total_events: tally.total,
            agent_count: tally.agents.len(),
            tool_executions: tally.count(EventType::ToolCompleted),
            avg_tool_execution_time: tally.avg_tool_time(),
            messages_received: tally.count(EventType::MessageReceived),
            messages_sent: tally.count(EventType::MessageSent),
            errors: tally.count(EventType::Error),
            plans_completed: tally.count(EventType::PlanCompleted),
            plans_failed: tally.count(EventType::PlanFailed),
            buffer_capacity: self.inner.capacity,
            event_counts: tally.counts,
        }
    }

    fn read_events(&self) -> RwLockReadGuard<'_, VecDeque<Event>> {
        // A poisoned lock still holds a consistent buffer: writers only
        // push/pop whole events.
        self.inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_events(&self) -> RwLockWriteGuard<'_, VecDeque<Event>> {
        self.inner
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let monitor = Monitor::new(MonitorConfig {
            capacity: 3,
            listener_buffer: 8,
        });
        for i in 0..5 {
            monitor.log_event("a", EventType::Custom, json!({"i": i}));
        }

        let events = monitor.get_events(&EventFilter::default());
        assert_eq!(events.len(), 3);
        let seq: Vec<i64> = events
            .iter()
            .map(|e| e.data["i"].as_i64().unwrap())
            .collect();
        assert_eq!(seq, vec![2, 3, 4]);
    }

    #[test]
    fn non_object_data_is_wrapped() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::Custom, json!(42));
        monitor.log_event("a", EventType::Custom, Value::Null);

        let events = monitor.get_events(&EventFilter::default());
        assert_eq!(events[0].data["value"], 42);
        assert!(events[1].data.is_empty());
    }

    #[test]
    fn filter_by_agent_type_and_limit() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::MessageSent, Value::Null);
        monitor.log_event("b", EventType::MessageSent, Value::Null);
        monitor.log_event("a", EventType::Error, Value::Null);
        monitor.log_event("a", EventType::MessageSent, json!({"n": 2}));

        let sent = monitor.get_events(&EventFilter::agent("a").of_type(EventType::MessageSent));
        assert_eq!(sent.len(), 2);

        let last = monitor.get_events(&EventFilter::agent("a").limit(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].data["n"], 2);
    }

    #[test]
    fn agent_metrics_aggregate() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::ToolCompleted, json!({"execution_time": 1.0}));
        monitor.log_event("a", EventType::ToolCompleted, json!({"execution_time": 3.0}));
        monitor.log_event("a", EventType::MessageReceived, Value::Null);
        monitor.log_event("a", EventType::Error, Value::Null);
        monitor.log_event("b", EventType::MessageSent, Value::Null);

        let m = monitor.get_agent_metrics("a");
        assert_eq!(m.total_events, 4);
        assert_eq!(m.tool_executions, 2);
        assert!((m.avg_tool_execution_time - 2.0).abs() < f64::EPSILON);
        assert_eq!(m.messages_received, 1);
        assert_eq!(m.messages_sent, 0);
        assert_eq!(m.errors, 1);
        assert!(m.first_seen.is_some());

        let empty = monitor.get_agent_metrics("nobody");
        assert_eq!(empty.total_events, 0);
        assert_eq!(empty.avg_tool_execution_time, 0.0);
    }

    #[test]
    fn system_metrics_aggregate() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::MessageSent, Value::Null);
        monitor.log_event("b", EventType::MessageSent, Value::Null);
        monitor.log_event("b", EventType::PlanCompleted, Value::Null);

        let m = monitor.get_system_metrics();
        assert_eq!(m.total_events, 3);
        assert_eq!(m.agent_count, 2);
        assert_eq!(m.messages_sent, 2);
        assert_eq!(m.plans_completed, 1);
        assert_eq!(m.event_counts.get(&EventType::MessageSent), Some(&2));
        assert_eq!(m.buffer_capacity, 1000);
    }

    #[test]
    fn metrics_serialize_with_string_keys() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::ToolStarted, Value::Null);
        let json = serde_json::to_value(monitor.get_system_metrics()).unwrap();
        assert_eq!(json["event_counts"]["tool_started"], 1);
    }

    #[tokio::test]
    async fn listeners_receive_events() {
        let monitor = Monitor::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = Arc::clone(&seen);
        let h1 = monitor.add_listener(move |_| {
            s1.fetch_add(1, Ordering::SeqCst);
        });
        let s2 = Arc::clone(&seen);
        let h2 = monitor.add_listener(move |_| {
            s2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.listener_count(), 2);

        monitor.log_event("a", EventType::Started, Value::Null);
        monitor.log_event("a", EventType::Stopped, Value::Null);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        h1.abort();
        h2.abort();
    }

    #[test]
    fn clear_empties_buffer() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::Custom, Value::Null);
        assert!(!monitor.is_empty());
        monitor.clear();
        assert!(monitor.is_empty());
    }

    #[test]
    fn poisoned_buffer_still_records() {
        let monitor = Monitor::default();
        monitor.log_event("a", EventType::Custom, Value::Null);

        let holder = monitor.clone();
        let poisoned = std::thread::spawn(move || {
            let _events = holder.inner.events.write().unwrap();
            panic!("poison the buffer lock");
        })
        .join();
        assert!(poisoned.is_err());
        assert!(monitor.inner.events.is_poisoned());

        monitor.log_event("a", EventType::Custom, Value::Null);
        assert_eq!(monitor.len(), 2);
        monitor.clear();
        assert!(monitor.is_empty());
    }

    #[test]
    fn event_type_names() {
        assert_eq!(EventType::ToolCompleted.to_string(), "tool_completed");
        assert_eq!(
            serde_json::to_string(&EventType::GoalFailed).unwrap(),
            "\"goal_failed\""
        );
    }
}
