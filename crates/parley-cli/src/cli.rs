//! Clap CLI definitions for parley.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  parley serve                  Run the coordinator on the configured address
  parley serve --listen 0.0.0.0:4100
  parley card                   Print the agent card this node would advertise
  parley config show            Print the effective configuration
  parley config check           Strictly validate a config file";

/// parley: agent-to-agent protocol coordinator.
#[derive(Parser)]
#[command(name = "parley", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.parley/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator (HTTP API + streaming endpoint).
    Serve {
        /// Override `listen_addr` from the config file.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Print the agent card as JSON.
    Card,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Read and validate the config file, failing on any problem.
    Check,
    /// Print the config file path in use.
    Path,
}
