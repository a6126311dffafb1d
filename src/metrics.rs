//! Prometheus instruments for the observability layer (C6).
//!
//! Instruments are process-wide singletons initialized once at startup
//! ([`Metrics::get`]); recording is lock-free and, per the non-blocking
//! contract, a bounded constant-time operation on the hot path. Gauges are
//! sampled on an interval by [`spawn_gauge_sampler`], which reads exclusively
//! from the reconciler's cache -- never issuing a LIST against the API
//! server.

use once_cell::sync::OnceCell;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec,
    HistogramVec, IntGaugeVec,
};
use std::time::Duration;

static METRICS: OnceCell<Metrics> = OnceCell::new();

pub struct Metrics {
    pub session_startup_duration: HistogramVec,
    pub session_total_duration: HistogramVec,
    pub reconcile_duration: HistogramVec,
    pub token_provision_duration: HistogramVec,
    pub image_pull_duration: HistogramVec,

    pub sessions_completed: CounterVec,
    pub session_phase_transitions: CounterVec,
    pub sessions_by_user: CounterVec,
    pub sessions_by_project: CounterVec,
    pub reconcile_retries: CounterVec,
    pub session_timeouts: CounterVec,
    pub s3_errors: CounterVec,
    pub token_refresh_errors: CounterVec,
    pub pod_restarts: CounterVec,

    pub sessions_active: IntGaugeVec,
    pub sessions_pending: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let duration_buckets = vec![0.1, 0.5, 1., 2.5, 5., 10., 30., 60., 120., 300.];

        Metrics {
            session_startup_duration: register_histogram_vec!(
                "session_startup_duration_seconds",
                "Time from Pending to Running for a session",
                &["namespace"],
                duration_buckets.clone()
            )
            .unwrap(),
            session_total_duration: register_histogram_vec!(
                "session_total_duration_seconds",
                "Time from Pending to a terminal phase for a session",
                &["namespace"],
                vec![1., 5., 30., 60., 300., 900., 1800., 3600., 7200.]
            )
            .unwrap(),
            reconcile_duration: register_histogram_vec!(
                "reconcile_duration_seconds",
                "Time spent in a single reconcile invocation",
                &["phase", "success"],
                vec![0.001, 0.005, 0.025, 0.1, 0.5, 1., 5., 15.]
            )
            .unwrap(),
            token_provision_duration: register_histogram_vec!(
                "token_provision_duration_seconds",
                "Time spent minting or refreshing a session bearer token",
                &["namespace"],
                vec![0.01, 0.05, 0.1, 0.5, 1., 5.]
            )
            .unwrap(),
            image_pull_duration: register_histogram_vec!(
                "image_pull_duration_seconds",
                "Observed time between pod creation and the image becoming ready",
                &["namespace", "image"],
                duration_buckets
            )
            .unwrap(),

            sessions_completed: register_counter_vec!(
                "sessions_completed_total",
                "Sessions that reached a terminal phase",
                &["namespace", "final_phase"]
            )
            .unwrap(),
            session_phase_transitions: register_counter_vec!(
                "session_phase_transitions_total",
                "Phase transitions observed by the reconciler",
                &["namespace", "from_phase", "to_phase"]
            )
            .unwrap(),
            sessions_by_user: register_counter_vec!(
                "sessions_by_user_total",
                "Sessions created, labeled by the created-by annotation",
                &["user"]
            )
            .unwrap(),
            sessions_by_project: register_counter_vec!(
                "sessions_by_project_total",
                "Sessions created, labeled by namespace",
                &["namespace"]
            )
            .unwrap(),
            reconcile_retries: register_counter_vec!(
                "reconcile_retries_total",
                "Reconciles that ended in a transient error or exceeded their soft deadline",
                &["namespace", "phase"]
            )
            .unwrap(),
            session_timeouts: register_counter_vec!(
                "session_timeouts_total",
                "Sessions that hit their configured timeout",
                &["namespace", "phase"]
            )
            .unwrap(),
            s3_errors: register_counter_vec!(
                "s3_errors_total",
                "Object-store operation failures",
                &["namespace", "operation", "session"]
            )
            .unwrap(),
            token_refresh_errors: register_counter_vec!(
                "token_refresh_errors_total",
                "Failed bearer-token refresh attempts",
                &["namespace", "session"]
            )
            .unwrap(),
            pod_restarts: register_counter_vec!(
                "pod_restarts_total",
                "Times a session's pod was recreated after disappearing out-of-band",
                &["namespace", "session"]
            )
            .unwrap(),

            sessions_active: register_int_gauge_vec!(
                "sessions_active",
                "Sessions currently in Creating, Running, or Stopping",
                &["namespace"]
            )
            .unwrap(),
            sessions_pending: register_int_gauge_vec!(
                "sessions_pending",
                "Sessions currently in Pending",
                &["namespace"]
            )
            .unwrap(),
        }
    }

    /// Returns the process-wide instrument set, creating it on first call.
    /// Safe to call from any reconcile path; registration only happens once.
    pub fn get() -> &'static Metrics {
        METRICS.get_or_init(Metrics::new)
    }
}

/// A phase snapshot used by the gauge sampler; produced from the reconciler's
/// indexed cache, never from a direct API LIST (§9).
pub struct PhaseCounts {
    pub namespace: String,
    pub pending: i64,
    pub active: i64,
}

/// Spawns a background task that samples `sample` roughly every 30 seconds
/// and publishes the results as gauges. `sample` must read from the in-memory
/// store populated by the controller's watch, not from the API server.
pub fn spawn_gauge_sampler<F>(sample: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Vec<PhaseCounts> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            let metrics = Metrics::get();
            for counts in sample() {
                metrics
                    .sessions_pending
                    .with_label_values(&[&counts.namespace])
                    .set(counts.pending);
                metrics
                    .sessions_active
                    .with_label_values(&[&counts.namespace])
                    .set(counts.active);
            }
        }
    })
}
