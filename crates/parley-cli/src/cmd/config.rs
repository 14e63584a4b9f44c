// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

use anyhow::Context;
use parley_kernel::config::{default_config_path, load_config, read_config};
use std::path::{Path, PathBuf};

fn resolve(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path)
}

pub fn cmd_config_show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path);
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("# {}\n", resolve(config_path).display());
    println!("{rendered}");
    Ok(())
}

pub fn cmd_config_check(config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = resolve(config_path);
    if !path.exists() {
        anyhow::bail!("no config file at {}", path.display());
    }
    let config = read_config(&path).with_context(|| format!("invalid config {}", path.display()))?;
    println!(
        "{} is valid: {} capabilities, {} protocols, listening on {}",
        path.display(),
        config.capabilities.len(),
        config.protocols.len(),
        config.listen_addr
    );
    Ok(())
}

pub fn cmd_config_path(config_path: Option<&Path>) {
    println!("{}", resolve(config_path).display());
}
