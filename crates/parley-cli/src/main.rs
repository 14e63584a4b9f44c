//! parley CLI: run and inspect an agent-to-agent protocol coordinator.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands, ConfigCommands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve { listen } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd::serve::cmd_serve(config_path, listen))
        }
        Commands::Card => {
            // Components are built inside a runtime context.
            let runtime = tokio::runtime::Runtime::new()?;
            let _guard = runtime.enter();
            cmd::card::cmd_card(config_path)
        }
        Commands::Config(ConfigCommands::Show) => cmd::config::cmd_config_show(config_path),
        Commands::Config(ConfigCommands::Check) => cmd::config::cmd_config_check(config_path),
        Commands::Config(ConfigCommands::Path) => {
            cmd::config::cmd_config_path(config_path);
            Ok(())
        }
    }
}
