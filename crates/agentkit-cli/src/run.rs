//! `agentkit run`: a small demo runtime.
//!
//! Wires one configured agent and a client agent onto a shared channel,
//! monitor and topic router, then exercises messaging, tools, topics and
//! goal pursuit before printing the collected metrics.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agentkit_agent::{
    Agent, FnTool, Goal, HierarchicalPlanner, PROCESS_SUBGOAL, ParamSpec, ParamType, Params,
    PlanRunner, handler,
};
use agentkit_kernel::{Channel, InProcessChannel, Message, Monitor, TopicRouter};
use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::info;

use crate::helpers::{build_memory, init_tracing, load_config};

const CLIENT_ID: &str = "client";
const STARTUP_TOPIC: &str = "runtime.started";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn cmd_run(config_path: Option<&Path>, steps: Vec<String>) -> Result<()> {
    init_tracing("info");

    let config = load_config(config_path)?;
    info!(agent_id = %config.agent.id, "starting agentkit runtime");

    let monitor = Monitor::new(config.monitor.clone());
    let channel: Arc<dyn Channel> = Arc::new(
        InProcessChannel::new(config.channel.clone()).context("failed to create channel")?,
    );
    let router = TopicRouter::new(Arc::clone(&channel));
    let memory = build_memory(&config)?;

    let planner = HierarchicalPlanner::new(
        PlanRunner::new(config.planner.clone())
            .with_monitor(monitor.clone(), config.agent.id.clone()),
    );

    let assistant = Agent::builder(config.agent.id.clone())
        .name(config.agent.name.clone())
        .description(config.agent.description.clone())
        .channel(Arc::clone(&channel))
        .monitor(monitor.clone())
        .memory(memory.handle())
        .planner(Arc::new(planner))
        .build();
    register_tools(&assistant);
    register_echo_handler(&assistant);

    let (tx, mut inbox) = mpsc::unbounded_channel();
    let client = Agent::builder(CLIENT_ID)
        .channel(Arc::clone(&channel))
        .monitor(monitor.clone())
        .build();
    for intent in ["echo_reply", "announcement"] {
        let tx = tx.clone();
        client.register_message_handler(
            intent,
            handler(move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok(None)
                }
            }),
        );
    }

    assistant.start().await?;
    client.start().await?;
    router.subscribe_pattern(CLIENT_ID, r"^runtime\.")?;

    // Direct message round trip through the echo tool.
    client
        .send_message(assistant.id(), "echo", json!({"text": "hello from the client"}))
        .await?;
    let reply = next_message(&mut inbox).await?;
    println!("echo reply: {}", reply.content);

    // Topic broadcast.
    let delivered = router
        .publish(
            STARTUP_TOPIC,
            Message::new(assistant.id(), "announcement", json!({"agent": assistant.id()})),
        )
        .await?;
    let announcement = next_message(&mut inbox).await?;
    println!(
        "topic {} delivered to {delivered} subscriber(s): {}",
        announcement.topic().unwrap_or(STARTUP_TOPIC),
        announcement.content
    );

    // Goal pursuit.
    let goal = steps.iter().fold(
        Goal::new("demo", "Work through the requested steps"),
        |goal, step| goal.with_subgoal(Goal::new(step.as_str(), "")),
    );
    let outcome = assistant.pursue_goal(goal).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    let forgotten = memory.compact(config.memory.forget_threshold).await?;
    if forgotten > 0 {
        info!(forgotten, "long-term memory compacted");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&monitor.get_system_metrics())?
    );

    client.stop().await?;
    assistant.stop().await?;
    channel.close().await?;
    info!("shutting down");
    Ok(())
}

async fn next_message(inbox: &mut mpsc::UnboundedReceiver<Message>) -> Result<Message> {
    tokio::time::timeout(REPLY_TIMEOUT, inbox.recv())
        .await
        .context("timed out waiting for a message")?
        .context("client inbox closed")
}

fn register_tools(agent: &Agent) {
    agent.register_tool(Arc::new(
        FnTool::new("echo", "Return the given text unchanged", |params: Params| async move {
            Ok(params.get("text").cloned().unwrap_or(Value::Null))
        })
        .with_param(ParamSpec::required("text", ParamType::String).with_description("Text to echo")),
    ));

    agent.register_tool(Arc::new(
        FnTool::new(PROCESS_SUBGOAL, "Mark a subgoal as handled", |params: Params| async move {
            let name = params.get("name").cloned().unwrap_or(Value::Null);
            info!(subgoal = %name, "processing subgoal");
            Ok(json!({"subgoal": name, "status": "done"}))
        })
        .with_param(ParamSpec::required("name", ParamType::String)),
    ));
}

fn register_echo_handler(agent: &Agent) {
    let weak = agent.downgrade();
    agent.register_message_handler(
        "echo",
        handler(move |message: Message| {
            let weak = weak.clone();
            async move {
                let Some(tools) = weak.upgrade() else {
                    return Ok(None);
                };
                let params = message.content.as_object().cloned().unwrap_or_default();
                let output = tools.execute_tool("echo", params).await;
                Ok(Some(message.reply(tools.id(), "echo_reply", output.value)))
            }
        }),
    );
}
