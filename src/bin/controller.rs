//! Entry point for the Session Lifecycle Controller process.

use clap::Parser;
use session_controller::config::OperatorConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    session_controller::telemetry::init("info,session_controller=debug,kube=info");

    let config = OperatorConfig::parse();
    let client = session_controller::build_client(config.client_qps, config.client_burst).await?;

    let shutdown = CancellationToken::new();
    let metrics_shutdown = shutdown.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(error) = session_controller::server::serve(metrics_port, metrics_shutdown).await {
            tracing::error!(%error, "metrics server exited");
        }
    });

    if config.leader_election {
        let holder_id = std::env::var("HOSTNAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let lock = session_controller::acquire_leader_lease(
            client.clone(),
            &config.operator_namespace,
            &holder_id,
        )
        .await;
        tokio::spawn(session_controller::hold_leader_lease(lock, shutdown.clone()));
    } else {
        info!("leader election disabled, reconciling unconditionally");
    }

    tokio::select! {
        () = session_controller::run(client, config) => {}
        () = shutdown.cancelled() => {
            tracing::warn!("shutdown requested (leader lease lost or signal), stopping controller");
        }
    }
    shutdown.cancel();
    Ok(())
}
