//! End-to-end tests for the agent runtime.
//!
//! Agents here talk over a real [`InProcessChannel`], share one
//! [`Monitor`], and drive plans through their own tools.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use agentkit_agent::{
    Agent, AgentError, AgentState, ExecutionContext, FnTool, Goal, HierarchicalPlanner,
    PROCESS_SUBGOAL, ParamSpec, ParamType, Params, Plan, PlanRunner, PlanStep, Planner,
    PlannerConfig, TaskStatus, handler, step_callable,
};
use agentkit_kernel::{
    Channel, ChannelConfig, EventFilter, EventType, InProcessChannel, Message, Monitor,
    TopicRouter,
};
use agentkit_store::{LongTermMemory, Memory, SqliteStorage};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn channel() -> Arc<dyn Channel> {
    Arc::new(InProcessChannel::new(ChannelConfig::default()).unwrap())
}

fn echo_tool() -> Arc<FnTool> {
    Arc::new(
        FnTool::new("echo", "Echo the text back", |p: Params| async move {
            Ok(p.get("text").cloned().unwrap_or(Value::Null))
        })
        .with_param(ParamSpec::required("text", ParamType::String)),
    )
}

/// An agent that forwards every `intent` message it receives into a queue.
fn collector(
    id: &str,
    intent: &str,
    channel: Arc<dyn Channel>,
    monitor: Monitor,
) -> (Agent, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let agent = Agent::builder(id).channel(channel).monitor(monitor).build();
    agent.register_message_handler(
        intent,
        handler(move |m: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
                Ok(None)
            }
        }),
    );
    (agent, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("queue closed")
}

// ═══════════════════════════════════════════════════════════════════════
//  Messaging
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn echo_round_trip_between_agents() {
    let channel = channel();
    let monitor = Monitor::default();

    let echo = Agent::builder("echo-agent")
        .channel(Arc::clone(&channel))
        .monitor(monitor.clone())
        .build();
    echo.register_tool(echo_tool());
    let weak = echo.downgrade();
    echo.register_message_handler(
        "echo",
        handler(move |m: Message| {
            let weak = weak.clone();
            async move {
                let Some(tools) = weak.upgrade() else {
                    return Ok(None);
                };
                let params = m.content.as_object().cloned().unwrap_or_default();
                let out = tools.execute_tool("echo", params).await;
                Ok(Some(m.reply(tools.id(), "echo_reply", out.value)))
            }
        }),
    );

    let (client, mut replies) = collector("client", "echo_reply", Arc::clone(&channel), monitor.clone());

    echo.start().await.unwrap();
    client.start().await.unwrap();

    let sent = client
        .send_message("echo-agent", "echo", json!({"text": "hello"}))
        .await
        .unwrap();

    let reply = recv(&mut replies).await;
    assert_eq!(reply.content, json!("hello"));
    assert_eq!(reply.sender, "echo-agent");
    assert_eq!(reply.reply_to, Some(sent));

    let metrics = monitor.get_system_metrics();
    assert_eq!(metrics.tool_executions, 1);
    assert!(metrics.messages_sent >= 2);
    assert!(metrics.messages_received >= 2);
}

#[tokio::test]
async fn stopped_agent_receives_nothing() {
    let channel = channel();
    let monitor = Monitor::default();
    let calls = Arc::new(AtomicU32::new(0));

    let target = Agent::builder("target")
        .channel(Arc::clone(&channel))
        .monitor(monitor.clone())
        .build();
    let counter = Arc::clone(&calls);
    target.register_message_handler(
        "ping",
        handler(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }),
    );
    let sender = Agent::builder("sender")
        .channel(Arc::clone(&channel))
        .monitor(monitor.clone())
        .build();

    target.start().await.unwrap();
    target.stop().await.unwrap();

    sender.send_message("target", "ping", json!(null)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(
        target
            .process_message(Message::new("sender", "ping", json!(null)))
            .await
            .is_none()
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(target.state(), AgentState::Stopped);
}

#[tokio::test]
async fn topic_pattern_reaches_agent() {
    let channel = channel();
    let router = TopicRouter::new(Arc::clone(&channel));
    let (reader, mut inbox) = collector("reader", "news", Arc::clone(&channel), Monitor::default());
    reader.start().await.unwrap();

    router.subscribe_pattern("reader", r"^news\..*$").unwrap();
    let delivered = router
        .publish("news.sports", Message::new("wire", "news", json!({"score": "2-1"})))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let message = recv(&mut inbox).await;
    assert_eq!(message.topic(), Some("news.sports"));
    assert_eq!(message.content["score"], json!("2-1"));
}

#[tokio::test]
async fn missing_handler_is_visible_in_metrics() {
    let agent = Agent::builder("quiet").build();
    assert!(
        agent
            .process_message(Message::new("x", "no-such-intent", json!(null)))
            .await
            .is_none()
    );
    assert_eq!(agent.metrics().errors, 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Tools
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn required_parameter_is_enforced() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let agent = Agent::builder("worker").build();
    agent.register_tool(Arc::new(
        FnTool::new("greet", "", move |p: Params| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(format!("hello {}", p["name"].as_str().unwrap_or_default())))
            }
        })
        .with_param(ParamSpec::required("name", ParamType::String)),
    ));

    let rejected = agent.execute_tool("greet", Params::new()).await;
    assert!(rejected.is_error());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut params = Params::new();
    params.insert("name".into(), json!("ada"));
    let accepted = agent.execute_tool("greet", params).await;
    assert_eq!(accepted.value, json!("hello ada"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let completed = agent
        .monitor()
        .get_events(&EventFilter::agent("worker").of_type(EventType::ToolCompleted));
    let statuses: Vec<&Value> = completed.iter().map(|e| &e.data["status"]).collect();
    assert_eq!(statuses, vec![&json!("error"), &json!("success")]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Planning
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failing_step_is_retried_then_stops_the_plan() {
    let second_calls = Arc::new(AtomicU32::new(0));
    let third_calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&second_calls);
    let failing = step_callable(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Internal("service unavailable".into()))
        }
    });
    let counter = Arc::clone(&third_calls);
    let never = step_callable(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    let first = PlanStep::callable("first", step_callable(|_| async { Ok(json!("ok")) }));
    let second = PlanStep::callable("second", failing).with_retry_count(2);
    let second_id = second.id;
    let third = PlanStep::callable("third", never);

    let planner = HierarchicalPlanner::default();
    let plan = Plan::new(Goal::new("three steps", ""), vec![first, second, third]);
    let plan_id = plan.id;

    let outcome = planner.execute_plan(plan, &ExecutionContext::new()).await;
    assert!(outcome.is_error());
    assert_eq!(outcome.failed_step, Some(second_id));
    assert!(outcome.message.contains("service unavailable"));
    assert_eq!(second_calls.load(Ordering::SeqCst), 3);
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    let stored = planner.repository().get_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(stored.steps[0].status, TaskStatus::Completed);
    assert_eq!(stored.steps[1].status, TaskStatus::Failed);
    assert_eq!(stored.steps[1].retry_attempts, 2);
    assert_eq!(stored.steps[2].status, TaskStatus::Pending);
    assert_eq!(stored.current_step, 1);
}

#[tokio::test]
async fn agent_replans_once_and_succeeds() {
    let monitor = Monitor::default();
    let config = PlannerConfig {
        max_replan_depth: 1,
        default_retry_count: 0,
        ..PlannerConfig::default()
    };
    let planner = Arc::new(HierarchicalPlanner::new(
        PlanRunner::new(config).with_monitor(monitor.clone(), "planner-agent"),
    ));

    let agent = Agent::builder("planner-agent")
        .monitor(monitor.clone())
        .planner(planner.clone())
        .build();

    // Fails the first time it is called, succeeds afterwards.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    agent.register_tool(Arc::new(FnTool::new(
        PROCESS_SUBGOAL,
        "",
        move |p: Params| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::Internal("cold start".into()))
                } else {
                    Ok(p.get("name").cloned().unwrap_or_default())
                }
            }
        },
    )));

    let goal = Goal::new("release", "ship it").with_subgoal(Goal::new("build", ""));
    let goal_id = goal.id;

    let outcome = agent.pursue_goal(goal).await.unwrap();
    assert!(outcome.is_success(), "{}", outcome.message);
    assert_eq!(outcome.replans, 1);
    assert_eq!(outcome.results, vec![json!("build")]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(agent.state(), AgentState::Idle);

    let plans = planner.repository().plans_for_goal(goal_id).await.unwrap();
    assert_eq!(plans.len(), 2);
    let original = plans.iter().find(|p| p.id != outcome.plan_id).unwrap();
    let replacement = plans.iter().find(|p| p.id == outcome.plan_id).unwrap();
    assert_eq!(
        replacement.metadata_str("previous_plan_id"),
        Some(original.id.to_string().as_str())
    );
    assert_eq!(original.status, TaskStatus::Failed);
    assert_eq!(replacement.goal.status, TaskStatus::Completed);

    let events = |t| monitor.get_events(&EventFilter::agent("planner-agent").of_type(t)).len();
    assert_eq!(events(EventType::GoalCreated), 1);
    assert_eq!(events(EventType::PlanCreated), 2);
    assert_eq!(events(EventType::PlanFailed), 1);
    assert_eq!(events(EventType::GoalCompleted), 1);
    assert_eq!(events(EventType::ToolCompleted), 2);
}

#[tokio::test]
async fn replanning_gives_up_at_max_depth() {
    let config = PlannerConfig {
        max_replan_depth: 1,
        default_retry_count: 0,
        ..PlannerConfig::default()
    };
    let planner = Arc::new(HierarchicalPlanner::new(PlanRunner::new(config)));
    let agent = Agent::builder("stubborn").planner(planner.clone()).build();
    agent.register_tool(Arc::new(FnTool::new(PROCESS_SUBGOAL, "", |_| async {
        Err(AgentError::Internal("always broken".into()))
    })));

    let goal = Goal::new("doomed", "").with_subgoal(Goal::new("part", ""));
    let outcome = agent.pursue_goal(goal.clone()).await.unwrap();

    assert!(outcome.is_error());
    assert_eq!(outcome.replans, 1);
    let stored_goal = planner.repository().get_goal(goal.id).await.unwrap().unwrap();
    assert_eq!(stored_goal.status, TaskStatus::Failed);
    assert_eq!(agent.state(), AgentState::Idle);
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn agent_can_use_durable_long_term_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let memory: Arc<dyn Memory> =
        Arc::new(LongTermMemory::new(Arc::new(SqliteStorage::open(&path).unwrap())));

    let agent = Agent::builder("archivist").memory(Arc::clone(&memory)).build();
    agent.register_message_handler("note", handler(|_| async { Ok(None) }));

    let message = Message::new("user", "note", json!({"text": "remember the milk"}));
    agent.process_message(message.clone()).await;

    let reopened = LongTermMemory::new(Arc::new(SqliteStorage::open(&path).unwrap()));
    let hits = reopened.search("milk", Some("messages"), None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, message.message_id.to_string());
}
