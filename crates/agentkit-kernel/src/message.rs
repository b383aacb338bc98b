//! Inter-agent message envelope.
//!
//! A [`Message`] is the immutable unit of communication between agents.  It
//! carries an *intent* string used by the recipient to pick a handler, an
//! arbitrary JSON payload, and enough addressing metadata (recipients,
//! correlation and reply ids) to support request/response conversations.
//!
//! Expiry via [`Message::is_expired`] is advisory: channels deliver expired
//! messages like any other, and consumers decide what to do with them.
//!
//! # Wire shape
//!
//! ```json
//! {
//!   "message_id": "0190…", "sender": "a", "intent": "ping",
//!   "content": {}, "correlation_id": null, "reply_to": null,
//!   "recipients": ["b"], "priority": 0, "ttl": null,
//!   "metadata": {}, "timestamp": "2026-01-01T00:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;

/// An intent-tagged message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique, time-ordered identifier.
    pub message_id: Uuid,

    /// Id of the sending agent.
    pub sender: String,

    /// Routing key used by the recipient to select a handler.
    pub intent: String,

    /// Arbitrary structured payload.
    #[serde(default)]
    pub content: Value,

    /// Conversation identifier shared by a request and its replies.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,

    /// Id of the message this one answers.
    #[serde(default)]
    pub reply_to: Option<Uuid>,

    /// Explicit recipient ids.  Empty means "decided by the router".
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Higher values are more urgent.
    #[serde(default)]
    pub priority: i32,

    /// Time-to-live in seconds, measured from `timestamp`.
    #[serde(default)]
    pub ttl: Option<u64>,

    /// Free-form metadata (the topic router stamps `topic` here).
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh id and the current timestamp.
    pub fn new(sender: impl Into<String>, intent: impl Into<String>, content: Value) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            sender: sender.into(),
            intent: intent.into(),
            content,
            correlation_id: None,
            reply_to: None,
            recipients: Vec::new(),
            priority: 0,
            ttl: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the recipient list.
    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// Add a single recipient.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time-to-live in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: Uuid) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build a reply addressed to this message's sender.
    ///
    /// The reply shares this message's correlation id (or uses this
    /// message's id to start a new conversation) and points back at it via
    /// `reply_to`.
    pub fn reply(
        &self,
        sender: impl Into<String>,
        intent: impl Into<String>,
        content: Value,
    ) -> Self {
        Self::new(sender, intent, content)
            .to(self.sender.clone())
            .with_correlation_id(self.correlation_id.unwrap_or(self.message_id))
            .with_reply_to(self.message_id)
    }

    /// Whether the message has outlived its ttl.  Always `false` without a ttl.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = now.signed_duration_since(self.timestamp);
                age.num_milliseconds() > i64::try_from(ttl).unwrap_or(i64::MAX).saturating_mul(1000)
            }
            None => false,
        }
    }

    /// The topic stamped by the topic router, if any.
    pub fn topic(&self) -> Option<&str> {
        self.metadata.get("topic").and_then(Value::as_str)
    }

    /// Encode to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
