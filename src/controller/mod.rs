//! Session Lifecycle Controller reconciler (C2). Owns the per-phase
//! transition logic in [`fsm`], delegates pod shape to
//! [`crate::composer`], credential lifecycle to [`crate::credentials`],
//! and status writes to [`status`]. Every reconcile re-reads the session
//! and its owned pod in full and re-derives a decision -- there is no
//! hidden state between passes beyond what's stored in the CR itself, so a
//! restarted controller or a duplicate event is always safe to replay.

pub mod fsm;
mod pod;
mod status;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, warn};

use crate::composer;
use crate::config::OperatorConfig;
use crate::credentials::{self, TokenManager};
use crate::error::Error;
use crate::metrics::{Metrics, PhaseCounts};
use crate::resource::{Phase, Session, SessionStatus};

use fsm::{DesiredPhase, GenerationDrift, PodAction, PodObservation};
use status::StatusPatch;

const LABEL_MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=session-controller";

/// Shared, read-only state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub namespaces: Store<Namespace>,
}

pub async fn run(client: Client, config: OperatorConfig) {
    let sessions: Api<Session> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let concurrency = u32::from(config.max_concurrent_reconciles);

    let (namespace_reader, namespace_writer) = reflector::store::<Namespace>();
    let namespaces: Api<Namespace> = Api::all(client.clone());
    tokio::spawn(
        watcher(namespaces, watcher::Config::default())
            .default_backoff()
            .reflect(namespace_writer)
            .applied_objects()
            .for_each(|result| async move {
                if let Err(error) = result {
                    warn!(%error, "namespace watch error");
                }
            }),
    );

    let ctx = Arc::new(Context {
        client,
        config,
        namespaces: namespace_reader,
    });

    let controller = Controller::new(sessions, watcher::Config::default())
        .owns(pods, watcher::Config::default().labels(LABEL_MANAGED_BY_SELECTOR))
        .with_config(controller::Config::default().concurrency(concurrency));

    let store = controller.store();
    crate::metrics::spawn_gauge_sampler(move || sample_phase_counts(&store));

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciled"),
                Err(error) => warn!(%error, "reconcile error"),
            }
        })
        .await;
}

fn sample_phase_counts(store: &kube::runtime::reflector::Store<Session>) -> Vec<PhaseCounts> {
    let mut counts: BTreeMap<String, PhaseCounts> = BTreeMap::new();
    for session in store.state() {
        let namespace = session.namespace().unwrap_or_default();
        let entry = counts.entry(namespace.clone()).or_insert(PhaseCounts {
            namespace,
            pending: 0,
            active: 0,
        });
        match session.status.as_ref().map(|s| s.phase).unwrap_or_default() {
            Phase::Pending => entry.pending += 1,
            Phase::Creating | Phase::Running | Phase::Stopping => entry.active += 1,
            Phase::Stopped | Phase::Completed | Phase::Failed => {}
        }
    }
    counts.into_values().collect()
}

fn error_policy(session: Arc<Session>, error: &Error, _ctx: Arc<Context>) -> Action {
    let namespace = session.namespace().unwrap_or_default();
    error!(%namespace, name = %session.name_any(), %error, "reconcile failed");
    if error.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        // Permanent errors are surfaced via status, not retried in a hot
        // loop; the next spec or annotation change will trigger another pass.
        Action::requeue(Duration::from_secs(300))
    }
}

async fn reconcile(session: Arc<Session>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let current_phase = session.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let phase_label = phase_label_of(current_phase);
    let namespace = session.namespace().unwrap_or_default();

    let deadline = ctx.config.reconcile_deadline();
    let outcome = match tokio::time::timeout(deadline, reconcile_inner(&session, &ctx)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::DeadlineExceeded(deadline)),
    };

    let success = if outcome.is_ok() { "true" } else { "false" };
    Metrics::get()
        .reconcile_duration
        .with_label_values(&[&phase_label, success])
        .observe(start.elapsed().as_secs_f64());

    if let Err(error) = &outcome {
        if error.is_transient() {
            Metrics::get()
                .reconcile_retries
                .with_label_values(&[&namespace, &phase_label])
                .inc();
        }
    }

    outcome
}

async fn reconcile_inner(session: &Session, ctx: &Context) -> Result<Action, Error> {
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::MissingMetadata("session is missing .metadata.namespace".to_string()))?;

    if !namespace_is_managed(&ctx.namespaces, &namespace) {
        debug!(%namespace, "namespace is not managed, ignoring");
        return Ok(Action::await_change());
    }

    let current_phase = session.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let desired = DesiredPhase::parse(session.desired_phase_annotation());
    let pod = pod::get_owned_pod(&ctx.client, session).await?;
    let observation = pod.as_ref().map(pod::classify).unwrap_or(PodObservation::Absent);

    let drift = if current_phase == Phase::Running {
        fsm::classify_drift(
            session.meta().generation,
            session.status.as_ref().and_then(|s| s.observed_generation),
            session.spec.cold_fields_hash(),
            pod_cold_hash(pod.as_ref()),
        )
    } else {
        GenerationDrift::None
    };

    let mut decision = fsm::decide(current_phase, observation, desired, drift);

    if current_phase == Phase::Running && check_timeout(session) == Some(true) {
        Metrics::get()
            .session_timeouts
            .with_label_values(&[&namespace, &phase_label_of(current_phase)])
            .inc();
        decision = fsm::decide(Phase::Running, PodObservation::Failed, None, GenerationDrift::None);
        if let Some(transition) = &mut decision.transition {
            let timeout = Duration::from_secs(u64::from(session.spec.timeout_seconds));
            transition.message = Some(format!(
                "session exceeded its configured timeout of {}",
                humantime::format_duration(timeout)
            ));
        }
    }

    // Permanent pre-flight check: a session about to get its first pod
    // composed but missing a mandatory integration credential fails fast
    // rather than spinning in Creating forever (composer §7 class 3).
    if decision.pod_action == PodAction::Compose {
        if let Some(message) = missing_mandatory_credential(&ctx.client, &namespace, &ctx.config).await? {
            status::apply(
                &ctx.client,
                session,
                StatusPatch {
                    phase: Some(Phase::Failed),
                    completion_time: Some(status_now()),
                    message: Some(message),
                    observed_generation: session.meta().generation,
                    ..Default::default()
                },
            )
            .await?;
            return Ok(Action::await_change());
        }
    }

    apply_pod_action(session, ctx, decision.pod_action).await?;

    let orphans_removed = pod::repair_orphans(&ctx.client, session).await?;
    if orphans_removed > 0 {
        warn!(%namespace, name = %session.name_any(), orphans_removed, "removed orphaned pod(s)");
        Metrics::get()
            .reconcile_retries
            .with_label_values(&[&namespace, "orphan"])
            .inc();
    }

    // Minting failure before the session has a running pod fails the session
    // outright (§4.4); once `Running`, a refresh failure is best-effort --
    // counted and retried next pass, without aborting this reconcile (§4.4,
    // second sentence).
    let token_provisioned = match current_phase {
        Phase::Pending | Phase::Creating => match refresh_token(session, ctx).await {
            Ok(provisioned) => Some(provisioned),
            Err(error) => {
                warn!(%namespace, name = %session.name_any(), %error, "token provisioning failed, failing session");
                status::apply(
                    &ctx.client,
                    session,
                    StatusPatch {
                        phase: Some(Phase::Failed),
                        completion_time: Some(status_now()),
                        message: Some(format!("failed to provision session token: {error}")),
                        observed_generation: session.meta().generation,
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(Action::await_change());
            }
        },
        Phase::Running => Some(refresh_token(session, ctx).await?),
        _ => None,
    };

    // Per-session token secret is deleted once the record enters a terminal
    // phase (§3): it is no longer needed and the pod it authenticated is
    // already gone or going.
    if decision.transition.as_ref().is_some_and(|t| t.next.is_terminal()) {
        credentials::delete_token_secret(&ctx.client, &namespace, &composer::token_secret_name(session)).await?;
    }

    let pod_ready = pod.as_ref().map(pod::is_ready);
    let patch = build_status_patch(session, &decision, pod_ready, token_provisioned);
    record_transition_metrics(session, current_phase, &decision, &namespace, pod.as_ref());
    status::apply(&ctx.client, session, patch).await?;

    Ok(match decision.requeue_after {
        Some(duration) => Action::requeue(duration),
        None if decision.transition.is_some() => Action::requeue(Duration::from_millis(100)),
        None => Action::await_change(),
    })
}

/// Reads back the cold-fields hash [`crate::composer`] stamped on the pod at
/// compose time (`resource::ANNOTATION_SPEC_HASH`). `None` means no pod or
/// no annotation, which `fsm::classify_drift` treats as cold (§9: err on the
/// side of replacement).
fn pod_cold_hash(pod: Option<&Pod>) -> Option<u64> {
    pod?.annotations()
        .get(crate::resource::ANNOTATION_SPEC_HASH)
        .and_then(|value| value.parse().ok())
}

/// Consults the namespace reflector cache rather than issuing a live read on
/// every reconcile (§4.1's cache-for-hot-paths contract). A namespace not yet
/// in the cache -- deleted, or not yet synced after a restart -- is treated
/// as unmanaged, matching the fail-safe default elsewhere in this check.
fn namespace_is_managed(namespaces: &Store<Namespace>, namespace: &str) -> bool {
    let Some(ns) = namespaces.get(&ObjectRef::new(namespace)) else {
        return false;
    };
    let labels = ns.metadata.labels.unwrap_or_default();
    Session::is_managed_namespace(&labels)
}

async fn apply_pod_action(session: &Session, ctx: &Context, action: PodAction) -> Result<(), Error> {
    match action {
        PodAction::None => Ok(()),
        PodAction::Compose => {
            let workload = composer::compose(session, &ctx.config);
            credentials::ensure_service_account(&ctx.client, &workload.service_account).await?;
            pod::create(&ctx.client, &workload.pod).await
        }
        PodAction::Delete => {
            let namespace = session.namespace().unwrap_or_default();
            pod::delete(&ctx.client, &namespace, &session.pod_name()).await
        }
    }
}

/// Mints or rotates the session's bearer token, returning whether a valid
/// token is provisioned (used for the `TokenProvisioned` condition).
async fn refresh_token(session: &Session, ctx: &Context) -> Result<bool, Error> {
    let start = Instant::now();
    let manager = TokenManager::new(&ctx.client, &ctx.config);
    let sa_name = composer::service_account_name(session);
    let secret_name = composer::token_secret_name(session);
    let owner = vec![composer::owner_reference(session)];
    let labels = session.labels().clone();

    let result = manager
        .ensure_or_refresh(session, &sa_name, &secret_name, owner, labels)
        .await;

    let namespace = session.namespace().unwrap_or_default();
    Metrics::get()
        .token_provision_duration
        .with_label_values(&[&namespace])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(_) => Ok(true),
        Err(error) => {
            Metrics::get()
                .token_refresh_errors
                .with_label_values(&[&namespace, &session.name_any()])
                .inc();
            Err(error)
        }
    }
}

/// Checks whether the session's integration credentials are present before
/// the first pod is composed. Only the object-store secret is mandatory,
/// and only once an endpoint is actually configured.
async fn missing_mandatory_credential(
    client: &Client,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<Option<String>, Error> {
    if config.object_store_endpoint.is_none() {
        return Ok(None);
    }
    let secrets = credentials::verify_integration_secrets(client, namespace).await?;
    if secrets.object_store_present {
        Ok(None)
    } else {
        Ok(Some(format!(
            "object store configured ({}) but secret '{}' is missing from namespace '{namespace}'",
            config.object_store_endpoint.as_deref().unwrap_or_default(),
            credentials::OBJECT_STORE_SECRET_NAME,
        )))
    }
}

fn check_timeout(session: &Session) -> Option<bool> {
    let status = session.status.as_ref()?;
    let start_time = status.start_time.as_ref()?;
    let start = time_to_chrono(start_time)?;
    let elapsed = Utc::now().signed_duration_since(start).to_std().ok()?;
    let timeout = Duration::from_secs(u64::from(session.spec.timeout_seconds));
    Some(fsm::timeout_exceeded(elapsed, timeout))
}

fn time_to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.with_timezone(&Utc))
}

fn status_now() -> Time {
    Time::from(k8s_openapi::jiff::Timestamp::now())
}

fn phase_label_of(phase: Phase) -> String {
    format!("{phase:?}")
}

fn build_status_patch(
    session: &Session,
    decision: &fsm::Decision,
    pod_ready: Option<bool>,
    token_provisioned: Option<bool>,
) -> StatusPatch {
    let existing = session
        .status
        .as_ref()
        .map(|s: &SessionStatus| s.conditions.clone())
        .unwrap_or_default();
    let conditions = status::merge_conditions(&existing, pod_ready, token_provisioned);

    let mut patch = StatusPatch {
        observed_generation: decision.bump_observed_generation.then(|| session.meta().generation).flatten(),
        conditions: Some(conditions),
        ..Default::default()
    };

    if let Some(transition) = &decision.transition {
        patch.phase = Some(transition.next);
        patch.message = transition.message.clone();
        if transition.set_start_time {
            patch.start_time = Some(status_now());
        }
        if transition.set_completion_time {
            patch.completion_time = Some(status_now());
        }
        patch.clear_completion_time = transition.clear_completion_time;
        if transition.increment_restart_count {
            let current = session.status.as_ref().map(|s| s.restart_count).unwrap_or(0);
            patch.restart_count = Some(current + 1);
        }
        if transition.next == Phase::Creating {
            patch.job_name = Some(Some(session.pod_name()));
        }
    }

    patch
}

fn record_transition_metrics(
    session: &Session,
    current_phase: Phase,
    decision: &fsm::Decision,
    namespace: &str,
    pod: Option<&Pod>,
) {
    let metrics = Metrics::get();

    if decision.self_heal {
        metrics
            .pod_restarts
            .with_label_values(&[namespace, &session.name_any()])
            .inc();
    }

    let Some(transition) = &decision.transition else {
        return;
    };

    metrics
        .session_phase_transitions
        .with_label_values(&[namespace, &phase_label_of(current_phase), &phase_label_of(transition.next)])
        .inc();

    if current_phase == Phase::Pending && transition.next == Phase::Creating {
        if let Some(user) = session.created_by_annotation() {
            metrics.sessions_by_user.with_label_values(&[user]).inc();
        }
        metrics.sessions_by_project.with_label_values(&[namespace]).inc();
    }

    if transition.set_start_time {
        if let Some(created) = session.metadata.creation_timestamp.as_ref().and_then(time_to_chrono) {
            let elapsed = Utc::now().signed_duration_since(created).to_std().unwrap_or_default();
            metrics
                .session_startup_duration
                .with_label_values(&[namespace])
                .observe(elapsed.as_secs_f64());
        }
        record_image_pull_duration(pod, namespace);
    }

    if transition.next.is_terminal() {
        metrics
            .sessions_completed
            .with_label_values(&[namespace, &phase_label_of(transition.next)])
            .inc();
        if let Some(created) = session.metadata.creation_timestamp.as_ref().and_then(time_to_chrono) {
            let elapsed = Utc::now().signed_duration_since(created).to_std().unwrap_or_default();
            metrics
                .session_total_duration
                .with_label_values(&[namespace])
                .observe(elapsed.as_secs_f64());
        }
    }
}

/// Observes the elapsed time between pod creation and the Creating→Running
/// transition, once per container image (§4.6/§7 class-2). Best-effort: a
/// missing pod or creation timestamp simply skips the observation rather
/// than failing the reconcile.
fn record_image_pull_duration(pod: Option<&Pod>, namespace: &str) {
    let Some(pod) = pod else { return };
    let Some(created) = pod.metadata.creation_timestamp.as_ref().and_then(time_to_chrono) else {
        return;
    };
    let elapsed = Utc::now().signed_duration_since(created).to_std().unwrap_or_default();
    let metrics = Metrics::get();
    for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
        metrics
            .image_pull_duration
            .with_label_values(&[namespace, &container.image.clone().unwrap_or_default()])
            .observe(elapsed.as_secs_f64());
    }
}
