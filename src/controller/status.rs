//! Status sub-resource writer. Every write goes through server-side apply
//! with a forced, dedicated field manager: the reconciler only ever
//! describes the fields *it* owns, so a concurrent actor patching unrelated
//! status fields can never conflict with us.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::error::Result;
use crate::resource::{Phase, Session, SessionCondition, SessionStatus};

const FIELD_MANAGER: &str = "session-controller-status";

/// The subset of `SessionStatus` a single reconcile pass wants to write.
/// `None` fields are left untouched by omitting them from the patch body
/// rather than by serializing a null, so unrelated status fields survive.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub phase: Option<Phase>,
    pub observed_generation: Option<i64>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    pub clear_completion_time: bool,
    pub message: Option<String>,
    pub job_name: Option<Option<String>>,
    pub restart_count: Option<u32>,
    pub conditions: Option<Vec<SessionCondition>>,
}

pub async fn apply(client: &Client, session: &Session, patch: StatusPatch) -> Result<()> {
    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    let api: Api<Session> = Api::namespaced(client.clone(), &namespace);

    let mut status = serde_json::Map::new();
    if let Some(phase) = patch.phase {
        status.insert("phase".to_string(), serde_json::to_value(phase)?);
    }
    if let Some(generation) = patch.observed_generation {
        status.insert("observedGeneration".to_string(), serde_json::to_value(generation)?);
    }
    if let Some(start_time) = patch.start_time {
        status.insert("startTime".to_string(), serde_json::to_value(start_time)?);
    }
    if let Some(completion_time) = patch.completion_time {
        status.insert("completionTime".to_string(), serde_json::to_value(completion_time)?);
    } else if patch.clear_completion_time {
        status.insert("completionTime".to_string(), serde_json::Value::Null);
    }
    if let Some(message) = &patch.message {
        status.insert("message".to_string(), serde_json::to_value(message)?);
    }
    if let Some(job_name) = &patch.job_name {
        status.insert("jobName".to_string(), serde_json::to_value(job_name)?);
    }
    if let Some(restart_count) = patch.restart_count {
        status.insert("restartCount".to_string(), serde_json::to_value(restart_count)?);
    }
    if let Some(conditions) = &patch.conditions {
        status.insert("conditions".to_string(), serde_json::to_value(conditions)?);
    }
    status.insert("lastUpdated".to_string(), serde_json::to_value(now())?);

    let body = serde_json::json!({
        "apiVersion": "sessions.agentic.io/v1alpha1",
        "kind": "Session",
        "status": serde_json::Value::Object(status),
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
        .await?;
    Ok(())
}

fn now() -> Time {
    Time::from(k8s_openapi::jiff::Timestamp::now())
}

/// Builds the two informational conditions (§4.2's "purely informational"
/// note): `PodReady` from the last pod observation, `TokenProvisioned` from
/// whether a token mint/refresh succeeded this pass. Carries forward
/// whichever condition didn't change rather than rewriting both every time,
/// so `lastTransitionTime` only moves when the underlying status does.
pub fn merge_conditions(
    existing: &[SessionCondition],
    pod_ready: Option<bool>,
    token_provisioned: Option<bool>,
) -> Vec<SessionCondition> {
    let now_time = now();

    let prev_pod_ready = existing.iter().find_map(|c| match c {
        SessionCondition::PodReady { status, last_transition_time } => Some((*status, last_transition_time.clone())),
        _ => None,
    });
    let pod_condition = match &prev_pod_ready {
        Some((status, transition_time)) if *status == pod_ready => {
            SessionCondition::pod_ready(pod_ready, transition_time.clone())
        }
        _ => SessionCondition::pod_ready(pod_ready, now_time.clone()),
    };

    let prev_token = existing.iter().find_map(|c| match c {
        SessionCondition::TokenProvisioned { status, last_transition_time } => {
            Some((*status, last_transition_time.clone()))
        }
        _ => None,
    });
    let token_condition = match &prev_token {
        Some((status, transition_time)) if *status == token_provisioned => {
            SessionCondition::token_provisioned(token_provisioned, transition_time.clone())
        }
        _ => SessionCondition::token_provisioned(token_provisioned, now_time),
    };

    vec![pod_condition, token_condition]
}
