//! Leader election (A5): a `Lease` object gates which operator replica runs
//! the `Controller` loop. Gated at process granularity rather than
//! per-reconcile -- simpler to reason about, and matches the Deployment's
//! single-active-writer assumption for server-side-apply field managers.

use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LEASE_NAME: &str = "session-controller-leader";
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Blocks until this replica acquires the lease, then returns a lock that
/// must be kept alive (via [`hold`]) for as long as the controller runs.
pub async fn acquire(client: Client, namespace: &str, holder_id: &str) -> LeaseLock {
    let lock = LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_DURATION,
        },
    );

    loop {
        match lock.try_acquire_or_renew().await {
            Ok(LeaseLockResult { acquired_lease: true }) => {
                info!(%holder_id, "acquired leader lease");
                return lock;
            }
            Ok(LeaseLockResult { acquired_lease: false }) => {
                info!("waiting for leader lease to become available");
            }
            Err(error) => warn!(%error, "lease acquisition attempt failed, retrying"),
        }
        tokio::time::sleep(RENEW_INTERVAL).await;
    }
}

/// Renews the lease on `RENEW_INTERVAL` until cancelled. A renewal failure
/// means another replica may have taken over, so this cancels `shutdown`
/// rather than risk two writers; the controller loop selected against the
/// same token stops reconciling, and the process stands by instead of
/// exiting outright.
pub async fn hold(lock: LeaseLock, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(RENEW_INTERVAL) => {}
            () = shutdown.cancelled() => return,
        }
        match lock.try_acquire_or_renew().await {
            Ok(LeaseLockResult { acquired_lease: true }) => {}
            Ok(LeaseLockResult { acquired_lease: false }) => {
                warn!("lost leader lease, cancelling controller");
                shutdown.cancel();
                return;
            }
            Err(error) => {
                warn!(%error, "lease renewal failed, cancelling controller");
                shutdown.cancel();
                return;
            }
        }
    }
}
