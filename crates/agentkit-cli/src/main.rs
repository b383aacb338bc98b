//! CLI entry point for agentkit.
//!
//! This binary provides the `agentkit` command with subcommands for running
//! a demo runtime and checking configuration files.

mod cli;
mod helpers;
mod run;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, load_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, steps } => run::cmd_run(config.as_deref(), steps).await,
        Commands::CheckConfig { config } => cmd_check_config(config.as_deref()),
        Commands::DefaultConfig => cmd_default_config(),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(path: Option<&std::path::Path>) -> Result<()> {
    init_tracing("warn");

    let config = load_config(path)?;
    println!("{}", config.to_toml_string()?);
    println!("# configuration OK");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: default-config
// ---------------------------------------------------------------------------

fn cmd_default_config() -> Result<()> {
    let config = agentkit_agent::RuntimeConfig::default();
    print!("{}", config.to_toml_string()?);
    Ok(())
}
