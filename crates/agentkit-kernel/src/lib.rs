//! agentkit messaging kernel.
//!
//! This crate provides the communication and observability substrate shared
//! by every agent in the runtime:
//!
//! - **[`message`]** -- The immutable, intent-tagged [`Message`] envelope and
//!   its JSON wire form.
//! - **[`channel`]** -- The [`Channel`] transport contract and the
//!   [`InProcessChannel`] implementation (bounded queue + worker pool,
//!   at-most-once, unordered fan-out).
//! - **[`topic`]** -- [`TopicRouter`], topic- and regex-pattern-based fan-out
//!   layered over any channel.
//! - **[`monitor`]** -- [`Monitor`], a capped event ring buffer with listener
//!   notification and derived agent/system metrics.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod channel;
pub mod error;
pub mod message;
pub mod monitor;
pub mod topic;

// Re-export the most commonly used types at the crate root for convenience.
pub use channel::{Channel, ChannelConfig, InProcessChannel, Subscriber, subscriber};
pub use error::{KernelError, Result};
pub use message::Message;
pub use monitor::{
    AgentMetrics, Event, EventFilter, EventType, Monitor, MonitorConfig, SystemMetrics,
};
pub use topic::TopicRouter;
