use tokio::signal;
use tracing::{error, info};

use stateset_settlement as settlement;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = settlement::config::load_config()?;
    settlement::config::init_tracing(&cfg.log_level, cfg.log_json);

    let (state, event_rx) = settlement::AppState::bootstrap(&cfg).await?;

    // Events are logged by the processing loop itself; no extra handlers are registered.
    let events = tokio::spawn(settlement::events::process_events(event_rx, Vec::new()));

    let scheduler = state.scheduler();
    if cfg.scheduler.enabled {
        scheduler.start();
    } else {
        info!("Reconciliation scheduler disabled by configuration");
    }

    info!(
        environment = %cfg.environment,
        "stateset-settlement running; press Ctrl-C to stop"
    );
    shutdown_signal().await;

    info!("Shutdown requested");
    scheduler.stop().await;

    // Dropping the last senders closes the event channel so the loop can drain and exit.
    drop(scheduler);
    drop(state);
    if let Err(e) = events.await {
        error!(error = %e, "Event processor ended abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
