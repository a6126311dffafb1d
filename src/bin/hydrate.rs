//! Entry point for the init container that hydrates a session's scratch
//! volume before the agent container starts (spec §4.5).

use session_controller::hydrate::{run, HydrateConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    session_controller::telemetry::init("info,session_controller=debug");

    let config = HydrateConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    run(&config).await.map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    Ok(())
}
