//! Owned-pod lookup, phase classification, and deletion -- the pod half of
//! every reconcile. Deletion always uses background propagation so the
//! reconciler never blocks waiting for a pod to finish terminating; the
//! FSM treats "still present" the same way whether it's running or stuck
//! terminating, and just re-requeues.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::{Api, Client, ResourceExt};

use crate::controller::fsm::PodObservation;
use crate::error::Result;
use crate::resource::Session;

const FIELD_MANAGER: &str = "session-controller-pod";

pub async fn get_owned_pod(client: &Client, session: &Session) -> Result<Option<Pod>> {
    let namespace = session.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    Ok(pods.get_opt(&session.pod_name()).await?)
}

/// Maps a pod's `.status.phase` (plus container states where the phase
/// alone is ambiguous) onto the FSM's three-state-plus-absent vocabulary.
/// `None` pod input means "not observed at all" and is handled by the
/// caller before this is reached; this only classifies a pod we found.
pub fn classify(pod: &Pod) -> PodObservation {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    match phase {
        "Running" => PodObservation::Running,
        "Succeeded" => PodObservation::Succeeded,
        "Failed" => PodObservation::Failed,
        _ => PodObservation::Pending,
    }
}

/// Whether the pod's `Ready` condition is `True`; feeds the `PodReady`
/// status condition (informational only -- never read back by the FSM).
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub async fn create(client: &Client, pod: &Pod) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    pods.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(pod))
        .await?;
    Ok(())
}

pub async fn delete(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..DeleteParams::default()
    };
    match pods.delete(name, &dp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lists every pod in the namespace claimed by this session's labels and
/// deletes all but the one named `${session}-runner` (§8's invariant:
/// "exactly one pod exists per session in Creating/Running/Stopping").
/// Returns how many orphans were removed, for the `reconcile_retries{reason="orphan"}`
/// counter.
pub async fn repair_orphans(client: &Client, session: &Session) -> Result<u32> {
    let namespace = session.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let expected = session.pod_name();
    let selector = format!("sessions.agentic.io/session={}", session.name_any());
    let list = pods.list(&ListParams::default().labels(&selector)).await?;

    let mut removed = 0u32;
    for pod in list.items {
        let name = pod.name_any();
        if name != expected {
            delete(client, &namespace, &name).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn classify_maps_known_phases() {
        assert_eq!(classify(&pod_with_phase("Running")), PodObservation::Running);
        assert_eq!(classify(&pod_with_phase("Succeeded")), PodObservation::Succeeded);
        assert_eq!(classify(&pod_with_phase("Failed")), PodObservation::Failed);
        assert_eq!(classify(&pod_with_phase("Pending")), PodObservation::Pending);
    }

    #[test]
    fn classify_defaults_to_pending_when_phase_missing() {
        assert_eq!(classify(&Pod::default()), PodObservation::Pending);
    }

    #[test]
    fn is_ready_requires_true_ready_condition() {
        let mut pod = pod_with_phase("Running");
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..PodCondition::default()
        }]);
        assert!(is_ready(&pod));

        let not_ready = pod_with_phase("Running");
        assert!(!is_ready(&not_ready));
    }
}
