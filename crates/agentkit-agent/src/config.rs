//! Runtime configuration.
//!
//! A single [`RuntimeConfig`] describes one agent runtime.  It is loaded
//! from TOML, optionally overridden from `AGENTKIT_*` environment variables,
//! and validated before use:
//!
//! ```toml
//! [agent]
//! id = "assistant"
//!
//! [channel]
//! queue_capacity = 256
//! workers = 2
//!
//! [memory]
//! working_ttl_secs = 600
//! sqlite_path = "data/memory.db"
//!
//! [planner]
//! replan_threshold = 0.4
//! max_execution_time = 30.0
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentkit_kernel::{ChannelConfig, MonitorConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::planner::PlannerConfig;

/// Prefix of environment variables read by [`RuntimeConfig::apply_env_overrides`].
pub const ENV_PREFIX: &str = "AGENTKIT_";

/// Identity of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "agent".to_owned(),
            name: "agent".to_owned(),
            description: String::new(),
        }
    }
}

/// Memory layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Default ttl for working memory; unset entries never expire.
    pub working_ttl_secs: Option<u64>,
    /// Cap on long-term search results.
    pub long_term_top_k: usize,
    /// Importance below which `forget` removes long-term entries.
    pub forget_threshold: f64,
    /// SQLite file for durable memory; in-memory storage when unset.
    pub sqlite_path: Option<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_ttl_secs: None,
            long_term_top_k: 5,
            forget_threshold: 0.1,
            sqlite_path: None,
        }
    }
}

impl MemorySection {
    pub fn working_ttl(&self) -> Option<Duration> {
        self.working_ttl_secs.map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agent: AgentSection,
    pub channel: ChannelConfig,
    pub monitor: MonitorConfig,
    pub memory: MemorySection,
    pub planner: PlannerConfig,
}

impl RuntimeConfig {
    /// Parse TOML text.  Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.  Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading runtime config");
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), agent_id = %config.agent.id, "runtime config loaded");
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AgentError::ConfigError {
            reason: e.to_string(),
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs.
    ///
    /// Recognized names (after the `AGENTKIT_` prefix): `AGENT_ID`,
    /// `AGENT_NAME`, `CHANNEL_QUEUE_CAPACITY`, `CHANNEL_WORKERS`,
    /// `MONITOR_CAPACITY`, `WORKING_TTL_SECS`, `LONG_TERM_TOP_K`,
    /// `FORGET_THRESHOLD`, `SQLITE_PATH`, `REPLAN_THRESHOLD`,
    /// `MAX_REPLAN_DEPTH`, `DEFAULT_RETRY_COUNT`, `MAX_EXECUTION_SECS`.
    /// Others are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "AGENT_ID" => self.agent.id = value.to_owned(),
                "AGENT_NAME" => self.agent.name = value.to_owned(),
                "CHANNEL_QUEUE_CAPACITY" => self.channel.queue_capacity = parse(name, value)?,
                "CHANNEL_WORKERS" => self.channel.workers = parse(name, value)?,
                "MONITOR_CAPACITY" => self.monitor.capacity = parse(name, value)?,
                "WORKING_TTL_SECS" => self.memory.working_ttl_secs = Some(parse(name, value)?),
                "LONG_TERM_TOP_K" => self.memory.long_term_top_k = parse(name, value)?,
                "FORGET_THRESHOLD" => self.memory.forget_threshold = parse(name, value)?,
                "SQLITE_PATH" => self.memory.sqlite_path = Some(PathBuf::from(value)),
                "REPLAN_THRESHOLD" => self.planner.replan_threshold = parse(name, value)?,
                "MAX_REPLAN_DEPTH" => self.planner.max_replan_depth = parse(name, value)?,
                "DEFAULT_RETRY_COUNT" => self.planner.default_retry_count = parse(name, value)?,
                "MAX_EXECUTION_SECS" => {
                    let secs: f64 = parse(name, value)?;
                    self.planner.max_execution_time =
                        Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                            AgentError::ConfigError {
                                reason: format!("{ENV_PREFIX}{name}: {e}"),
                            }
                        })?);
                }
                _ => continue,
            }
            debug!(variable = %name, "config override applied");
        }
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(AgentError::ConfigError { reason });

        if self.agent.id.trim().is_empty() {
            return fail("agent.id must not be empty".into());
        }
        if self.channel.queue_capacity == 0 {
            return fail("channel.queue_capacity must be greater than zero".into());
        }
        if self.channel.workers == 0 {
            return fail("channel.workers must be greater than zero".into());
        }
        if self.monitor.capacity == 0 {
            return fail("monitor.capacity must be greater than zero".into());
        }
        if self.monitor.listener_buffer == 0 {
            return fail("monitor.listener_buffer must be greater than zero".into());
        }
        if self.memory.long_term_top_k == 0 {
            return fail("memory.long_term_top_k must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.memory.forget_threshold) {
            return fail(format!(
                "memory.forget_threshold must be within [0, 1], got {}",
                self.memory.forget_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.planner.replan_threshold) {
            return fail(format!(
                "planner.replan_threshold must be within [0, 1], got {}",
                self.planner.replan_threshold
            ));
        }
        if self.planner.max_execution_time == Some(Duration::ZERO) {
            return fail("planner.max_execution_time must be greater than zero".into());
        }
        Ok(())
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| AgentError::ConfigError {
        reason: format!("{ENV_PREFIX}{name}={value:?}: {e}"),
    })
}
