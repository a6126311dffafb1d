//! Cluster client construction (C1, write-client half). The read half -- the
//! typed, indexed cache -- is the `kube_runtime::reflector::Store` populated
//! automatically by the `Controller`'s watches; reconcile code reads from it
//! via the `Api` handles threaded through [`crate::controller::Context`].

use kube::{client::ConfigExt, Client, Config};
use std::time::Duration;
use tower::{limit::RateLimitLayer, ServiceBuilder};

/// Builds a `Client` whose request rate is capped above the library's
/// conservative defaults. Reconciles across many sessions would otherwise
/// throttle against a shared per-process limit (§4.1: QPS >= 100, burst >= 200).
pub async fn build(qps: u32, burst: u32) -> kube::Result<Client> {
    let config = Config::infer().await?;
    let default_ns = config.default_namespace.clone();

    let https = config.rustls_https_connector()?;
    // RateLimitLayer admits `burst` requests per window; sizing the window to
    // `burst / qps` seconds makes the steady-state admission rate equal `qps`
    // while still absorbing a `burst`-sized spike at the start of a window.
    let window = Duration::from_secs_f64(burst.max(1) as f64 / qps.max(1) as f64);
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .layer(RateLimitLayer::new(burst.max(1) as u64, window))
        .service(hyper::Client::builder().build(https));

    Ok(Client::new(service, default_ns))
}
