//! Topic- and pattern-based fan-out over a [`Channel`].
//!
//! The router keeps two tables:
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | topics | topic name | set of subscribed agent ids |
//! | patterns | agent id | compiled [`regex`] patterns |
//!
//! A topic's subscriber set is created lazily, on the first exact
//! subscription or publish, and seeded from every pattern that matches the
//! topic name.  Pattern subscriptions made later also join already-known
//! topics they match.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use agentkit_kernel::{ChannelConfig, InProcessChannel, Message, TopicRouter};
//! # async fn example() -> agentkit_kernel::Result<()> {
//! let channel = Arc::new(InProcessChannel::new(ChannelConfig::default())?);
//! let router = TopicRouter::new(channel);
//!
//! router.subscribe_pattern("dashboard", r"^metrics\..*$")?;
//! router
//!     .publish("metrics.cpu", Message::new("sensor", "sample", serde_json::json!(0.7)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use regex::Regex;
use serde_json::Value;

use crate::channel::Channel;
use crate::error::{KernelError, Result};
use crate::message::Message;

/// Routes topic publications to subscribed agents through a [`Channel`].
///
/// Safe to share across tasks; wrap in `Arc` for shared ownership.
pub struct TopicRouter {
    channel: Arc<dyn Channel>,

    /// Topic -> subscribed agent ids.
    topics: DashMap<String, HashSet<String>>,

    /// Agent id -> pattern subscriptions.
    patterns: DashMap<String, Vec<Regex>>,
}

impl TopicRouter {
    /// Create a router that delivers through `channel`.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            topics: DashMap::new(),
            patterns: DashMap::new(),
        }
    }

    /// The underlying transport.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Subscribe `agent_id` to an exact topic name.
    pub fn subscribe_topic(&self, agent_id: impl Into<String>, topic: impl Into<String>) {
        let agent_id = agent_id.into();
        let topic = topic.into();
        tracing::debug!(agent_id = %agent_id, topic = %topic, "topic subscription added");
        self.topic_entry(&topic).insert(agent_id);
    }

    /// Remove `agent_id` from one topic.  Returns whether it was subscribed.
    pub fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> bool {
        self.topics
            .get_mut(topic)
            .map(|mut subscribers| subscribers.remove(agent_id))
            .unwrap_or(false)
    }

    /// Subscribe `agent_id` to every topic whose name matches `pattern`.
    ///
    /// The pattern is a [`regex`] expression; anchor it (`^…$`) to match the
    /// whole topic name.  Returns an error if the regex fails to compile.
    pub fn subscribe_pattern(&self, agent_id: impl Into<String>, pattern: &str) -> Result<()> {
        let agent_id = agent_id.into();
        let compiled = Regex::new(pattern).map_err(|e| KernelError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        })?;

        // Registered before the scan: a topic created meanwhile is either
        // seeded from this pattern or visited below.
        self.patterns
            .entry(agent_id.clone())
            .or_default()
            .push(compiled.clone());

        for mut entry in self.topics.iter_mut() {
            if compiled.is_match(entry.key()) {
                entry.value_mut().insert(agent_id.clone());
            }
        }

        tracing::debug!(agent_id = %agent_id, pattern = %pattern, "pattern subscription added");
        Ok(())
    }

    /// Drop every topic and pattern subscription held by `agent_id`.
    pub fn unsubscribe_all(&self, agent_id: &str) {
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().remove(agent_id);
        }
        self.patterns.remove(agent_id);
        tracing::debug!(agent_id = %agent_id, "all topic subscriptions removed");
    }

    /// Publish `message` on `topic`.
    ///
    /// Creates the topic on first use (seeded from matching patterns),
    /// stamps `metadata["topic"]`, and hands off to [`TopicRouter::route`].
    /// Returns the number of recipients the message was published to.
    pub async fn publish(&self, topic: &str, mut message: Message) -> Result<usize> {
        drop(self.topic_entry(topic));

        message
            .metadata
            .insert("topic".into(), Value::String(topic.to_owned()));
        self.route(topic, message).await
    }

    /// Deliver `message` to its explicit recipients, or to the topic's
    /// current subscribers when it has none.
    pub async fn route(&self, topic: &str, message: Message) -> Result<usize> {
        let recipients: Vec<String> = if message.recipients.is_empty() {
            self.subscribers(topic)
        } else {
            message.recipients.clone()
        };

        if recipients.is_empty() {
            tracing::debug!(topic = %topic, message_id = %message.message_id, "topic has no subscribers");
            return Ok(0);
        }

        for recipient in &recipients {
            self.channel.publish(recipient, message.clone()).await?;
        }

        tracing::debug!(
            topic = %topic,
            message_id = %message.message_id,
            recipients = recipients.len(),
            "topic message routed"
        );
        Ok(recipients.len())
    }

    /// Current subscribers of `topic`, sorted.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .topics
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Known topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Agents holding at least one pattern that matches `topic`.
    /// The subscriber set of `topic`, created and seeded from matching
    /// patterns if it does not exist yet.
    fn topic_entry(&self, topic: &str) -> RefMut<'_, String, HashSet<String>> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| self.pattern_matches(topic).into_iter().collect())
    }

    fn pattern_matches(&self, topic: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|entry| entry.value().iter().any(|re| re.is_match(topic)))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
