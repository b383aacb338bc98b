//! Shared helper functions used across CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use agentkit_agent::RuntimeConfig;
use agentkit_store::{InMemoryStorage, LongTermMemory, Memory, SqliteStorage, WorkingMemory};
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Load `.env`, then the config file (or defaults), then `AGENTKIT_*`
/// overrides, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    if let Ok(env_path) = dotenvy::dotenv() {
        info!(path = %env_path.display(), "loaded .env");
    }

    let mut config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            info!("no config file given, using defaults");
            RuntimeConfig::default()
        }
    };

    config
        .apply_env_overrides()
        .context("invalid AGENTKIT_* environment override")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// The memory an agent runs with.
pub enum AgentMemory {
    Working(Arc<WorkingMemory>),
    LongTerm(Arc<LongTermMemory>),
}

impl AgentMemory {
    pub fn handle(&self) -> Arc<dyn Memory> {
        match self {
            Self::Working(memory) => Arc::clone(memory) as Arc<dyn Memory>,
            Self::LongTerm(memory) => Arc::clone(memory) as Arc<dyn Memory>,
        }
    }

    /// Drop long-term entries whose importance fell below `threshold`.
    /// Working memory expires on its own and is left alone.
    pub async fn compact(&self, threshold: f64) -> Result<usize> {
        match self {
            Self::Working(_) => Ok(0),
            Self::LongTerm(memory) => memory
                .forget(threshold)
                .await
                .context("failed to forget long-term entries"),
        }
    }
}

/// The agent memory described by `config.memory`.
///
/// With a `sqlite_path` the agent gets durable long-term memory; otherwise
/// process-local working memory with the configured ttl.
pub fn build_memory(config: &RuntimeConfig) -> Result<AgentMemory> {
    let section = &config.memory;
    match &section.sqlite_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let storage = SqliteStorage::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            info!(path = %path.display(), "long-term memory ready");
            Ok(AgentMemory::LongTerm(Arc::new(
                LongTermMemory::new(Arc::new(storage)).with_top_k(section.long_term_top_k),
            )))
        }
        None => {
            let mut memory = WorkingMemory::new(Arc::new(InMemoryStorage::new()));
            if let Some(ttl) = section.working_ttl() {
                memory = memory.with_default_ttl(ttl);
            }
            Ok(AgentMemory::Working(Arc::new(memory)))
        }
    }
}
