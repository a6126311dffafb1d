use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation read by the controller to learn the user-requested target phase.
/// Honored and cleared once effected; any value other than `Running`/`Stopped`
/// is logged and ignored.
pub const ANNOTATION_DESIRED_PHASE: &str = "sessions.agentic.io/desired-phase";
/// Opaque identifier of the human or service that created the session, forwarded to metrics labels.
pub const ANNOTATION_CREATED_BY: &str = "sessions.agentic.io/created-by";
/// Set when a session continues another; exposed to the agent container as `PARENT_SESSION_ID`.
pub const ANNOTATION_PARENT_SESSION_ID: &str = "sessions.agentic.io/parent-session-id";

/// Namespaces without this label set to `"true"` are ignored entirely.
pub const LABEL_MANAGED: &str = "sessions.agentic.io/managed";

/// Stamped on the composed pod with [`SessionSpec::cold_fields_hash`]'s
/// output at compose time; read back on later `Running` reconciles to tell
/// whether a `metadata.generation` bump needs a pod replacement (§4.2).
pub const ANNOTATION_SPEC_HASH: &str = "sessions.agentic.io/spec-hash";

/// Value the controller expects to see on `desired-phase` to request a run.
pub const DESIRED_PHASE_RUNNING: &str = "Running";
/// Value the controller expects to see on `desired-phase` to request a stop.
pub const DESIRED_PHASE_STOPPED: &str = "Stopped";

fn default_timeout_seconds() -> u32 {
    3600
}

fn default_branch() -> String {
    "main".to_string()
}

/// A single input repository to clone into the session's scratch root.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputRepo {
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

/// The active workflow to clone alongside input repos, if any.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Sub-path within the workflow repository to extract; the whole repo if unset.
    pub sub_path: Option<String>,
}

/// LLM sampling parameters, forwarded to the agent container verbatim.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Who asked for this session; forwarded to metrics labels and exposed to the
/// agent so it can attribute its output.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "sessions.agentic.io",
    version = "v1alpha1",
    kind = "Session",
    plural = "sessions",
    shortname = "sess",
    namespaced,
    status = "SessionStatus"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.startTime\", \"name\": \"STARTED\", \"type\": \"date\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.jobName\", \"name\": \"POD\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// The initial prompt handed to the agent on startup.
    pub prompt: String,
    /// Model identifier, e.g. `claude-3-7-sonnet`.
    pub model: String,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default)]
    pub repos: Vec<InputRepo>,
    pub workflow: Option<WorkflowRef>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    pub identity: SessionIdentity,
    /// User-supplied environment additions, merged last by the composer.
    /// `ValueFrom` entries win over plain values sharing the same name.
    #[serde(default)]
    pub environment_variables: Vec<EnvVar>,
}

impl SessionSpec {
    /// Hash of every field that requires a fresh pod if it changes.
    /// `timeout_seconds` and `environment_variables` are excluded: per §9's
    /// Open Question they're the two fields explicitly called out as hot,
    /// absorbed without a pod replacement (`timeout_seconds` is read live
    /// off the spec every reconcile; new env entries only take effect on
    /// the session's next natural pod replacement). Every other field errs
    /// on the side of requiring replacement.
    pub fn cold_fields_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.prompt.hash(&mut hasher);
        self.model.hash(&mut hasher);
        self.interactive.hash(&mut hasher);
        format!("{:?}", self.sampling_params).hash(&mut hasher);
        format!("{:?}", self.repos).hash(&mut hasher);
        format!("{:?}", self.workflow).hash(&mut hasher);
        format!("{:?}", self.identity).hash(&mut hasher);
        hasher.finish()
    }
}

/// Lifecycle phase of a session. No transition skips a state; see the
/// reconciler's per-phase rules for the full transition table.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy, Default, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Completed | Phase::Failed)
    }
}

/// Tri-state condition mirroring the Kubernetes `Unknown`/`True`/`False` convention.
/// Purely informational: the reconciler's phase transitions never read these back.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(tag = "type")]
pub enum SessionCondition {
    #[serde(rename_all = "camelCase")]
    PodReady {
        #[serde(
            serialize_with = "condition_status_ser",
            deserialize_with = "condition_status_de"
        )]
        status: Option<bool>,
        last_transition_time: Time,
    },
    #[serde(rename_all = "camelCase")]
    TokenProvisioned {
        #[serde(
            serialize_with = "condition_status_ser",
            deserialize_with = "condition_status_de"
        )]
        status: Option<bool>,
        last_transition_time: Time,
    },
}

impl SessionCondition {
    pub fn pod_ready(status: Option<bool>, now: Time) -> Self {
        Self::PodReady {
            status,
            last_transition_time: now,
        }
    }

    pub fn token_provisioned(status: Option<bool>, now: Time) -> Self {
        Self::TokenProvisioned {
            status,
            last_transition_time: now,
        }
    }
}

fn condition_status_de<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match String::deserialize(deserializer)?.as_ref() {
        "Unknown" => Ok(None),
        "True" => Ok(Some(true)),
        "False" => Ok(Some(false)),
        other => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Str(other),
            &"Unknown or True or False",
        )),
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn condition_status_ser<S>(status: &Option<bool>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(match status {
        Some(true) => "True",
        Some(false) => "False",
        None => "Unknown",
    })
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub phase: Phase,
    /// The last spec generation this status reflects; equal to `metadata.generation` at steady state.
    pub observed_generation: Option<i64>,
    /// Set exactly once, on the first transition into `Running`.
    pub start_time: Option<Time>,
    /// Set exactly once, on entry to any terminal phase; cleared on restart.
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub message: String,
    /// Name of the owned workload pod, `${sessionName}-runner`, once composed.
    pub job_name: Option<String>,
    /// Incremented each time a terminal session is restarted via `desired-phase=Running`.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SessionCondition>,
    pub last_updated: Option<Time>,
}

impl Session {
    pub fn pod_name(&self) -> String {
        format!("{}-runner", self.name_any())
    }

    pub fn is_managed_namespace(ns_labels: &BTreeMap<String, String>) -> bool {
        ns_labels.get(LABEL_MANAGED).is_some_and(|v| v == "true")
    }

    pub fn desired_phase_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_DESIRED_PHASE))
            .map(String::as_str)
    }

    pub fn created_by_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_CREATED_BY))
            .map(String::as_str)
    }

    pub fn parent_session_id_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_PARENT_SESSION_ID))
            .map(String::as_str)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_terminal_classification() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Creating.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(!Phase::Stopping.is_terminal());
        assert!(Phase::Stopped.is_terminal());
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
    }

    #[test]
    fn managed_namespace_requires_exact_true() {
        let mut labels = BTreeMap::new();
        assert!(!Session::is_managed_namespace(&labels));
        labels.insert(LABEL_MANAGED.to_string(), "yes".to_string());
        assert!(!Session::is_managed_namespace(&labels));
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        assert!(Session::is_managed_namespace(&labels));
    }

    #[test]
    fn condition_status_round_trips_tristate() {
        for status in [None, Some(true), Some(false)] {
            let cond = SessionCondition::pod_ready(status, Time::from(k8s_openapi::jiff::Timestamp::now()));
            let json = serde_json::to_value(&cond).unwrap();
            let back: SessionCondition = serde_json::from_value(json).unwrap();
            match back {
                SessionCondition::PodReady { status: s, .. } => assert_eq!(s, status),
                _ => panic!("wrong variant"),
            }
        }
    }

    #[test]
    fn desired_phase_annotation_reads_back() {
        let mut s = Session::new("demo", SessionSpec {
            prompt: "hi".into(),
            model: "claude-3-7-sonnet".into(),
            sampling_params: SamplingParams::default(),
            repos: vec![],
            workflow: None,
            interactive: false,
            timeout_seconds: default_timeout_seconds(),
            identity: SessionIdentity {
                user_id: "u1".into(),
                display_name: None,
            },
            environment_variables: vec![],
        });
        s.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_DESIRED_PHASE.to_string(),
            DESIRED_PHASE_STOPPED.to_string(),
        )]));
        assert_eq!(s.desired_phase_annotation(), Some(DESIRED_PHASE_STOPPED));
    }

    fn base_spec() -> SessionSpec {
        SessionSpec {
            prompt: "hi".into(),
            model: "claude-3-7-sonnet".into(),
            sampling_params: SamplingParams::default(),
            repos: vec![],
            workflow: None,
            interactive: false,
            timeout_seconds: default_timeout_seconds(),
            identity: SessionIdentity {
                user_id: "u1".into(),
                display_name: None,
            },
            environment_variables: vec![],
        }
    }

    #[test]
    fn cold_fields_hash_ignores_timeout_and_env_additions() {
        let mut spec = base_spec();
        let baseline = spec.cold_fields_hash();
        spec.timeout_seconds += 60;
        spec.environment_variables.push(EnvVar {
            name: "EXTRA".to_string(),
            value: Some("1".to_string()),
            value_from: None,
        });
        assert_eq!(spec.cold_fields_hash(), baseline);
    }

    #[test]
    fn cold_fields_hash_changes_with_prompt() {
        let mut spec = base_spec();
        let baseline = spec.cold_fields_hash();
        spec.prompt = "something else".into();
        assert_ne!(spec.cold_fields_hash(), baseline);
    }
}
