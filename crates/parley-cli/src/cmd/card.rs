//! `parley card`: print the agent card without serving.

use anyhow::Context;
use parley_kernel::config::load_config;
use parley_kernel::Coordinator;
use std::path::Path;

pub fn cmd_card(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path);
    let coordinator = Coordinator::boot(config).context("failed to boot coordinator")?;
    let card = coordinator.registry.describe();
    println!("{}", serde_json::to_string_pretty(&*card)?);
    Ok(())
}
