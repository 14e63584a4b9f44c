//! `parley serve`: boot the coordinator and serve until Ctrl+C.

use anyhow::Context;
use parley_kernel::config::load_config;
use parley_kernel::Coordinator;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

pub async fn cmd_serve(config_path: Option<&Path>, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    let addr = config.listen_addr;

    let coordinator = Coordinator::boot(config).context("failed to boot coordinator")?;
    coordinator.start_background();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let signal_target = coordinator.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down");
                signal_target.shutdown();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    parley_api::server::run_server(coordinator.clone(), listener)
        .await
        .context("server error")?;

    if !coordinator.supervisor.is_shutting_down() {
        coordinator.shutdown();
    }
    info!("Parley stopped");
    Ok(())
}
