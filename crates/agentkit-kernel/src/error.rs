//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for the agentkit messaging kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Channel errors -----------------------------------------------------
    /// The channel has been closed and no longer accepts messages.
    #[error("channel is closed")]
    ChannelClosed,

    /// The in-process channel was constructed outside a tokio runtime.
    #[error("channel construction failed: {reason}")]
    ChannelInit { reason: String },

    /// Enqueueing a delivery failed.
    #[error("publish to `{recipient}` failed: {reason}")]
    PublishFailed { recipient: String, reason: String },

    // -- Router errors ------------------------------------------------------
    /// A regex pattern supplied to the topic router is invalid.
    #[error("invalid regex pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // -- Message errors -----------------------------------------------------
    /// A message could not be encoded to or decoded from its wire form.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
