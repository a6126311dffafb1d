//! Entry point for the state-sync sidecar: periodic incremental sync-out
//! plus a SIGTERM/SIGINT-triggered final flush (spec §4.5).

use session_controller::state_sync::{run, StateSyncConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    session_controller::telemetry::init("info,session_controller=debug");

    let config = StateSyncConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    run(&config).await.map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    Ok(())
}
