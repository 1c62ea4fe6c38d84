use anyhow::Result;
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_groundstation::loggers;

mod relay_logic;
use relay_logic::{config, hub};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let _log_guard = loggers::setup_logging("telemetry_relay", &config.log_dir(), config.log_level())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let state = hub::RelayState::new(config.channel_capacity());
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(hub::serve(listener, state.clone(), shutdown.clone()));

    signal::ctrl_c().await?;
    log::info!("Ctrl-C received, initiating shutdown.");
    shutdown.cancel();

    server.await??;
    log::info!("Shutdown complete. {} frame(s) relayed.", state.relayed_frames());
    Ok(())
}
