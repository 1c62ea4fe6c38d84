use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

use lib_groundstation::ingestors::{ConnectionState, IngestionAdapter};
use lib_groundstation::loggers;

mod gateway_logic;
use gateway_logic::{config, station::Station};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config()?;
    let _log_guard = loggers::setup_logging("telemetry_gateway", &settings.log_dir, &settings.log_level)?;

    let adapter = Arc::new(IngestionAdapter::new(settings.ingest.clone()));
    let station = Station::assemble(&settings.modules_path, &adapter)?;

    let points = station.telemetry_points().await;
    if points.is_empty() {
        log::warn!("No enabled module serves live telemetry. Samples will be cached but not delivered.");
    }
    let subscriptions = station.log_points(&points);

    let mut states = adapter.watch_state();
    let state_logger = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            log::info!("Telemetry source is {:?}", state);
            if state == ConnectionState::Closed {
                break;
            }
        }
    });

    let mut tasks = adapter.spawn();

    // Wait for shutdown signal or for the ingestion loop to give up
    let mut finished = false;
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
        result = &mut tasks.ingest => {
            finished = true;
            match result {
                Ok(Ok(())) => log::info!("Ingestion stopped."),
                Ok(Err(e)) => log::error!("Ingestion failed: {}", e),
                Err(e) => log::error!("Ingestion task panicked: {}", e),
            }
        }
    }

    adapter.close();
    drop(subscriptions);

    if !finished {
        let _ = tasks.ingest.await;
    }
    let _ = tokio::join!(tasks.distribution, state_logger);

    let stats = adapter.stats();
    log::info!(
        "Shutdown complete. {} message(s) accepted, {} rejected.",
        stats.accepted,
        stats.rejected
    );
    Ok(())
}
