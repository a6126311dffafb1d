//! Operator process configuration, parsed from CLI flags or environment
//! variables (`clap`'s `env` feature lets the same binary run unmodified
//! under a Deployment that only sets env vars).

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Session lifecycle controller")]
pub struct OperatorConfig {
    /// Namespace the operator itself runs in (used for the leader-election lease).
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    pub operator_namespace: String,

    /// Namespace hosting backend-shared resources (integration credential secrets).
    #[arg(long, env = "BACKEND_NAMESPACE", default_value = "default")]
    pub backend_namespace: String,

    /// Image reference for the agent container.
    #[arg(long, env = "AGENT_IMAGE")]
    pub agent_image: String,

    /// Image reference for the content-service sidecar.
    #[arg(long, env = "CONTENT_SERVICE_IMAGE")]
    pub content_service_image: String,

    /// Image reference for the state-sync sidecar (also used for the init container).
    #[arg(long, env = "STATE_SYNC_IMAGE")]
    pub state_sync_image: String,

    /// `imagePullPolicy` applied to every container in the composed pod.
    #[arg(long, env = "IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    pub image_pull_policy: String,

    /// Default object-store endpoint (S3-compatible), used when a session
    /// doesn't carry its own override via the integration secret.
    #[arg(long, env = "OBJECT_STORE_ENDPOINT")]
    pub object_store_endpoint: Option<String>,

    /// Default object-store bucket.
    #[arg(long, env = "OBJECT_STORE_BUCKET")]
    pub object_store_bucket: Option<String>,

    /// Optional observability exporter endpoint, passed through to the agent container.
    #[arg(long, env = "OBSERVABILITY_ENDPOINT")]
    pub observability_endpoint: Option<String>,

    /// Backend API URL the agent container calls to report progress and
    /// fetch follow-up instructions (§4.3).
    #[arg(long, env = "BACKEND_API_URL")]
    pub backend_api_url: String,

    /// Size of the reconcile worker pool.
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 10)]
    pub max_concurrent_reconciles: u16,

    /// Disable leader election; only safe with a single replica.
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub leader_election: bool,

    /// Port the Prometheus exporter and health endpoints listen on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Client-side QPS limit; raised above library defaults (`4, 8` in `kube::Config`)
    /// so reconciles aren't throttled once many sessions exist.
    #[arg(long, env = "CLIENT_QPS", default_value_t = 100)]
    pub client_qps: u32,

    /// Client-side burst limit, paired with `client_qps`.
    #[arg(long, env = "CLIENT_BURST", default_value_t = 200)]
    pub client_burst: u32,

    /// Default bearer-token lifetime minted by the credential manager.
    #[arg(long, env = "TOKEN_LIFETIME_SECONDS", default_value_t = 3600)]
    pub token_lifetime_seconds: u32,

    /// Default object-store region, forwarded to the hydrate/state-sync containers.
    #[arg(long, env = "OBJECT_STORE_REGION")]
    pub object_store_region: Option<String>,

    /// Default `syncInterval` for the state-sync sidecar (§4.5).
    #[arg(long, env = "SYNC_INTERVAL_SECONDS", default_value_t = 60)]
    pub sync_interval_seconds: u32,

    /// Default `maxSyncSize` for the state-sync sidecar, in bytes (§4.5, 1 GiB).
    #[arg(long, env = "MAX_SYNC_SIZE_BYTES", default_value_t = 1 << 30)]
    pub max_sync_size_bytes: u64,

    /// Soft deadline for a single reconcile (§5); exceeding it is a transient error.
    #[arg(long, env = "RECONCILE_DEADLINE_SECONDS", default_value_t = 30)]
    pub reconcile_deadline_seconds: u64,
}

impl OperatorConfig {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_seconds as u64)
    }

    /// Threshold at which `Running` reconciles refresh the token: three
    /// quarters of its total lifetime have elapsed (§4.4).
    pub fn token_refresh_threshold(&self) -> Duration {
        self.token_lifetime() * 3 / 4
    }

    pub fn reconcile_deadline(&self) -> Duration {
        Duration::from_secs(self.reconcile_deadline_seconds)
    }

    /// Recommended `terminationGracePeriodSeconds`: one sync cycle plus a
    /// safety margin, so the final flush has room to finish (§4.5).
    pub fn termination_grace_period_seconds(&self) -> i64 {
        i64::from(self.sync_interval_seconds) + 30
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_refresh_threshold_is_three_quarters_of_lifetime() {
        let cfg = OperatorConfig {
            operator_namespace: "default".into(),
            backend_namespace: "default".into(),
            agent_image: "agent:latest".into(),
            content_service_image: "content:latest".into(),
            state_sync_image: "state-sync:latest".into(),
            image_pull_policy: "IfNotPresent".into(),
            object_store_endpoint: None,
            object_store_bucket: None,
            observability_endpoint: None,
            backend_api_url: "https://backend.internal".into(),
            max_concurrent_reconciles: 10,
            leader_election: true,
            metrics_port: 9090,
            client_qps: 100,
            client_burst: 200,
            token_lifetime_seconds: 3600,
            object_store_region: None,
            sync_interval_seconds: 60,
            max_sync_size_bytes: 1 << 30,
            reconcile_deadline_seconds: 30,
        };
        assert_eq!(cfg.token_refresh_threshold(), Duration::from_secs(2700));
    }
}
