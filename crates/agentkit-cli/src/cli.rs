//! CLI argument definitions.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// agentkit -- an in-process multi-agent runtime.
#[derive(Parser)]
#[command(
    name = "agentkit",
    version,
    about = "agentkit -- in-process multi-agent runtime",
    long_about = "Runs agents that exchange messages over an in-process channel, \
                  call tools, pursue goals through planners and remember what they saw."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a demo runtime: two agents, an echo round trip, a topic
    /// broadcast and a goal pursued through the hierarchical planner.
    Run {
        /// TOML configuration file.  Defaults are used when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Subgoals for the demo goal.
        #[arg(long = "step", default_values = ["gather", "summarize"])]
        steps: Vec<String>,
    },

    /// Load, override and validate a configuration file, then print the
    /// effective configuration.
    CheckConfig {
        /// TOML configuration file.  Defaults are checked when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}
