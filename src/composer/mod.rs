//! Workload Composer (C3): turns a [`Session`] plus operator configuration
//! into a fully-specified pod and its auxiliary objects. Pure and
//! deterministic -- given the same session and config, byte-identical specs
//! come out, with no wall-clock inputs and stable key ordering (`BTreeMap`
//! everywhere labels/annotations are built).

mod env;

use crate::config::OperatorConfig;
use crate::credentials;
use crate::resource::{Session, ANNOTATION_PARENT_SESSION_ID, ANNOTATION_SPEC_HASH};
use env::merge_env;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PodSecurityContext, PodSpec,
    SecretKeySelector, SecurityContext, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

const SCRATCH_VOLUME: &str = "scratch";
const SCRATCH_MOUNT_PATH: &str = "/scratch";
const AGENT_SCRATCH_SUBPATH: &str = "agent";
const AGENT_SCRATCH_MOUNT_PATH: &str = "/scratch/agent";
const LABEL_SESSION_NAME: &str = "sessions.agentic.io/session";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const MANAGER_NAME: &str = "session-controller";

/// Name of the per-session bearer-token secret; owned by C4 but named here
/// since both the composer and the credential manager need to agree on it.
pub fn token_secret_name(session: &Session) -> String {
    format!("{}-token", session.name_any())
}

/// Name of the per-session service account.
pub fn service_account_name(session: &Session) -> String {
    format!("{}-runner", session.name_any())
}

pub fn owner_reference(session: &Session) -> OwnerReference {
    OwnerReference {
        api_version: <Session as Resource>::api_version(&()).to_string(),
        kind: <Session as Resource>::kind(&()).to_string(),
        name: session.name_any(),
        uid: session.uid().expect("Session has no metadata.uid"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn common_labels(session: &Session) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SESSION_NAME.to_string(), session.name_any()),
        (LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
    ])
}

/// Everything the composer produces for a session that does not yet have a pod.
pub struct ComposedWorkload {
    pub pod: Pod,
    pub service_account: ServiceAccount,
}

pub fn compose(session: &Session, config: &OperatorConfig) -> ComposedWorkload {
    let sa_name = service_account_name(session);
    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(sa_name.clone()),
            namespace: session.namespace(),
            labels: Some(common_labels(session)),
            owner_references: Some(vec![owner_reference(session)]),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    };

    let pod = build_pod(session, config, &sa_name);

    ComposedWorkload {
        pod,
        service_account,
    }
}

fn build_pod(session: &Session, config: &OperatorConfig, service_account_name: &str) -> Pod {
    let name = session.pod_name();
    let namespace = session.namespace();

    let scratch_volume = Volume {
        name: SCRATCH_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    };

    let full_scratch_mount = || VolumeMount {
        name: SCRATCH_VOLUME.to_string(),
        mount_path: SCRATCH_MOUNT_PATH.to_string(),
        ..VolumeMount::default()
    };
    let agent_scratch_mount = VolumeMount {
        name: SCRATCH_VOLUME.to_string(),
        mount_path: AGENT_SCRATCH_MOUNT_PATH.to_string(),
        sub_path: Some(AGENT_SCRATCH_SUBPATH.to_string()),
        ..VolumeMount::default()
    };

    let object_store_env = object_store_env(config);

    let init_container = Container {
        name: "init".to_string(),
        image: Some(config.state_sync_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        command: Some(vec!["session-hydrate".to_string()]),
        env: Some(hydrate_env(session, config, &object_store_env)),
        volume_mounts: Some(vec![full_scratch_mount()]),
        ..Container::default()
    };

    let agent_container = Container {
        name: "agent".to_string(),
        image: Some(config.agent_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(agent_env(session, config, &object_store_env)),
        volume_mounts: Some(vec![full_scratch_mount(), agent_scratch_mount]),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..SecurityContext::default()
        }),
        ..Container::default()
    };

    let content_container = Container {
        name: "content-service".to_string(),
        image: Some(config.content_service_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(vec![scratch_root_env()]),
        volume_mounts: Some(vec![full_scratch_mount()]),
        ..Container::default()
    };

    let mut state_sync_env = hydrate_env(session, config, &object_store_env);
    state_sync_env.push(EnvVar {
        name: "SYNC_INTERVAL_SECONDS".to_string(),
        value: Some(config.sync_interval_seconds.to_string()),
        value_from: None,
    });
    state_sync_env.push(EnvVar {
        name: "MAX_SYNC_SIZE_BYTES".to_string(),
        value: Some(config.max_sync_size_bytes.to_string()),
        value_from: None,
    });
    let state_sync_container = Container {
        name: "state-sync".to_string(),
        image: Some(config.state_sync_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        command: Some(vec!["session-state-sync".to_string()]),
        env: Some(state_sync_env),
        volume_mounts: Some(vec![full_scratch_mount()]),
        ..Container::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: namespace.clone(),
            labels: Some(common_labels(session)),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_SPEC_HASH.to_string(),
                session.spec.cold_fields_hash().to_string(),
            )])),
            owner_references: Some(vec![owner_reference(session)]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(service_account_name.to_string()),
            restart_policy: Some("Never".to_string()),
            enable_service_links: Some(false),
            termination_grace_period_seconds: Some(config.termination_grace_period_seconds()),
            security_context: Some(PodSecurityContext {
                fs_group: Some(1000),
                ..PodSecurityContext::default()
            }),
            init_containers: Some(vec![init_container]),
            containers: vec![agent_container, content_container, state_sync_container],
            volumes: Some(vec![scratch_volume]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn scratch_root_env() -> EnvVar {
    EnvVar {
        name: "SCRATCH_ROOT".to_string(),
        value: Some(SCRATCH_MOUNT_PATH.to_string()),
        value_from: None,
    }
}

/// Object-store environment shared by any container that talks to S3
/// directly: endpoint/bucket/region as plain values, credentials as
/// `ValueFrom` references into the mirrored integration secret (§4.4.3).
/// The secret is marked optional so a session with no object-store
/// integration configured doesn't fail pod admission; `Pending` validates
/// presence separately when an endpoint *is* configured (§7 class 3).
fn object_store_env(config: &OperatorConfig) -> Vec<EnvVar> {
    let mut env = vec![scratch_root_env()];
    if let Some(endpoint) = &config.object_store_endpoint {
        env.push(EnvVar {
            name: "OBJECT_STORE_ENDPOINT".to_string(),
            value: Some(endpoint.clone()),
            value_from: None,
        });
    }
    if let Some(bucket) = &config.object_store_bucket {
        env.push(EnvVar {
            name: "OBJECT_STORE_BUCKET".to_string(),
            value: Some(bucket.clone()),
            value_from: None,
        });
    }
    if let Some(region) = &config.object_store_region {
        env.push(EnvVar {
            name: "OBJECT_STORE_REGION".to_string(),
            value: Some(region.clone()),
            value_from: None,
        });
    }
    env.push(secret_ref_env(
        "AWS_ACCESS_KEY_ID",
        credentials::OBJECT_STORE_SECRET_NAME,
        credentials::OBJECT_STORE_ACCESS_KEY_FIELD,
    ));
    env.push(secret_ref_env(
        "AWS_SECRET_ACCESS_KEY",
        credentials::OBJECT_STORE_SECRET_NAME,
        credentials::OBJECT_STORE_SECRET_KEY_FIELD,
    ));
    env
}

fn secret_ref_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..EnvVarSource::default()
        }),
    }
}

/// Environment shared by the init and state-sync containers: namespace,
/// session name, object-store config, and the input-repo / workflow
/// manifests needed to hydrate or re-sync the scratch root.
fn hydrate_env(session: &Session, _config: &OperatorConfig, object_store_env: &[EnvVar]) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "SESSION_NAMESPACE".to_string(),
            value: session.namespace(),
            value_from: None,
        },
        EnvVar {
            name: "SESSION_NAME".to_string(),
            value: Some(session.name_any()),
            value_from: None,
        },
        EnvVar {
            name: "INPUT_REPOS_JSON".to_string(),
            value: Some(
                serde_json::to_string(&session.spec.repos).unwrap_or_else(|_| "[]".to_string()),
            ),
            value_from: None,
        },
    ];
    if let Some(workflow) = &session.spec.workflow {
        env.push(EnvVar {
            name: "WORKFLOW_URL".to_string(),
            value: Some(workflow.url.clone()),
            value_from: None,
        });
        env.push(EnvVar {
            name: "WORKFLOW_BRANCH".to_string(),
            value: Some(workflow.branch.clone()),
            value_from: None,
        });
        if let Some(sub_path) = &workflow.sub_path {
            env.push(EnvVar {
                name: "WORKFLOW_SUB_PATH".to_string(),
                value: Some(sub_path.clone()),
                value_from: None,
            });
        }
    }
    env.extend(object_store_env.iter().cloned());
    env
}

/// Environment for the agent container: session identity, LLM config, the
/// backend API URL, the bearer token reference, and anything the user asked
/// to add. The bearer token and mirrored integration-secret references are
/// injected by [`crate::credentials`] before this is called; the composer
/// only merges what it's handed, so the asymmetric override rule lives in
/// one place.
fn agent_env(session: &Session, config: &OperatorConfig, object_store_env: &[EnvVar]) -> Vec<EnvVar> {
    let mut operator_env = vec![
        EnvVar {
            name: "SESSION_NAMESPACE".to_string(),
            value: session.namespace(),
            value_from: None,
        },
        EnvVar {
            name: "SESSION_NAME".to_string(),
            value: Some(session.name_any()),
            value_from: None,
        },
        EnvVar {
            name: "PROMPT".to_string(),
            value: Some(session.spec.prompt.clone()),
            value_from: None,
        },
        EnvVar {
            name: "MODEL".to_string(),
            value: Some(session.spec.model.clone()),
            value_from: None,
        },
        EnvVar {
            name: "INTERACTIVE".to_string(),
            value: Some(session.spec.interactive.to_string()),
            value_from: None,
        },
        EnvVar {
            name: "TIMEOUT_SECONDS".to_string(),
            value: Some(session.spec.timeout_seconds.to_string()),
            value_from: None,
        },
        EnvVar {
            name: "BACKEND_API_URL".to_string(),
            value: Some(config.backend_api_url.clone()),
            value_from: None,
        },
        EnvVar {
            name: "BEARER_TOKEN".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: token_secret_name(session),
                    key: "token".to_string(),
                    optional: None,
                }),
                ..EnvVarSource::default()
            }),
        },
        secret_ref_env(
            "GIT_PROVIDER_TOKEN",
            credentials::GIT_PROVIDER_SECRET_NAME,
            credentials::GIT_PROVIDER_TOKEN_FIELD,
        ),
    ];
    if let Some(temperature) = session.spec.sampling_params.temperature {
        operator_env.push(EnvVar {
            name: "SAMPLING_TEMPERATURE".to_string(),
            value: Some(temperature.to_string()),
            value_from: None,
        });
    }
    if let Some(top_p) = session.spec.sampling_params.top_p {
        operator_env.push(EnvVar {
            name: "SAMPLING_TOP_P".to_string(),
            value: Some(top_p.to_string()),
            value_from: None,
        });
    }
    if let Some(max_tokens) = session.spec.sampling_params.max_tokens {
        operator_env.push(EnvVar {
            name: "SAMPLING_MAX_TOKENS".to_string(),
            value: Some(max_tokens.to_string()),
            value_from: None,
        });
    }
    if let Some(parent_id) = session.parent_session_id_annotation() {
        operator_env.push(EnvVar {
            name: ANNOTATION_PARENT_SESSION_ID.replace('/', "_").to_uppercase(),
            value: Some(parent_id.to_string()),
            value_from: None,
        });
    }
    if let Some(endpoint) = &config.observability_endpoint {
        operator_env.push(EnvVar {
            name: "OBSERVABILITY_ENDPOINT".to_string(),
            value: Some(endpoint.clone()),
            value_from: None,
        });
    }
    operator_env.extend(object_store_env.iter().cloned());

    merge_env(operator_env, session.spec.environment_variables.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{SamplingParams, SessionIdentity, SessionSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as K8sObjectMeta;

    fn test_config() -> OperatorConfig {
        OperatorConfig {
            operator_namespace: "default".into(),
            backend_namespace: "default".into(),
            agent_image: "agent:latest".into(),
            content_service_image: "content:latest".into(),
            state_sync_image: "state-sync:latest".into(),
            image_pull_policy: "IfNotPresent".into(),
            object_store_endpoint: Some("https://s3.example.com".into()),
            object_store_bucket: Some("sessions".into()),
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
        }
    }

    fn test_session() -> Session {
        let mut session = Session::new(
            "demo",
            SessionSpec {
                prompt: "hello".into(),
                model: "claude-3-7-sonnet".into(),
                sampling_params: SamplingParams::default(),
                repos: vec![],
                workflow: None,
                interactive: false,
                timeout_seconds: 600,
                identity: SessionIdentity {
                    user_id: "u1".into(),
                    display_name: None,
                },
                environment_variables: vec![],
            },
        );
        session.metadata = K8sObjectMeta {
            name: Some("demo".into()),
            namespace: Some("team-a".into()),
            uid: Some("11111111-1111-1111-1111-111111111111".into()),
            ..K8sObjectMeta::default()
        };
        session
    }

    #[test]
    fn pod_name_has_runner_suffix() {
        let session = test_session();
        assert_eq!(session.pod_name(), "demo-runner");
    }

    #[test]
    fn compose_is_deterministic() {
        let session = test_session();
        let config = test_config();
        let first = compose(&session, &config);
        let second = compose(&session, &config);
        assert_eq!(
            serde_json::to_value(&first.pod).unwrap(),
            serde_json::to_value(&second.pod).unwrap()
        );
    }

    #[test]
    fn pod_carries_controller_owner_reference() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let owners = composed.pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].name, "demo");
    }

    #[test]
    fn agent_container_env_includes_user_additions_after_defaults() {
        let mut session = test_session();
        session.spec.environment_variables.push(EnvVar {
            name: "EXTRA_FLAG".to_string(),
            value: Some("1".to_string()),
            value_from: None,
        });
        let config = test_config();
        let composed = compose(&session, &config);
        let agent = composed
            .pod
            .spec
            .unwrap()
            .containers
            .into_iter()
            .find(|c| c.name == "agent")
            .unwrap();
        let env = agent.env.unwrap();
        assert!(env.iter().any(|e| e.name == "EXTRA_FLAG"));
        let bearer = env.iter().find(|e| e.name == "BEARER_TOKEN").unwrap();
        assert!(bearer.value_from.is_some());
    }

    #[test]
    fn termination_grace_period_covers_one_sync_cycle_plus_margin() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let spec = composed.pod.spec.unwrap();
        assert_eq!(spec.termination_grace_period_seconds, Some(90));
    }

    #[test]
    fn four_containers_total_with_init() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let spec = composed.pod.spec.unwrap();
        assert_eq!(spec.init_containers.unwrap().len(), 1);
        assert_eq!(spec.containers.len(), 3);
    }

    #[test]
    fn object_store_credentials_are_optional_secret_refs_on_init_and_state_sync() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let spec = composed.pod.spec.unwrap();
        for container in spec
            .init_containers
            .unwrap()
            .into_iter()
            .chain(spec.containers.into_iter().filter(|c| c.name == "state-sync"))
        {
            let env = container.env.unwrap();
            let key = env.iter().find(|e| e.name == "AWS_ACCESS_KEY_ID").unwrap();
            let secret_ref = key.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
            assert_eq!(secret_ref.name, credentials::OBJECT_STORE_SECRET_NAME);
            assert_eq!(secret_ref.optional, Some(true));
        }
    }

    #[test]
    fn state_sync_container_carries_sync_interval_and_max_size() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let spec = composed.pod.spec.unwrap();
        let state_sync = spec
            .containers
            .into_iter()
            .find(|c| c.name == "state-sync")
            .unwrap();
        let env = state_sync.env.unwrap();
        assert!(env.iter().any(|e| e.name == "SYNC_INTERVAL_SECONDS"
            && e.value.as_deref() == Some("60")));
        assert!(env
            .iter()
            .any(|e| e.name == "MAX_SYNC_SIZE_BYTES" && e.value.as_deref() == Some("1073741824")));
    }

    #[test]
    fn pod_is_stamped_with_cold_fields_hash() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let annotations = composed.pod.metadata.annotations.unwrap();
        let stamped: u64 = annotations
            .get(crate::resource::ANNOTATION_SPEC_HASH)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(stamped, session.spec.cold_fields_hash());
    }

    #[test]
    fn agent_container_env_includes_backend_api_url() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let agent = composed
            .pod
            .spec
            .unwrap()
            .containers
            .into_iter()
            .find(|c| c.name == "agent")
            .unwrap();
        let env = agent.env.unwrap();
        let backend_url = env.iter().find(|e| e.name == "BACKEND_API_URL").unwrap();
        assert_eq!(backend_url.value.as_deref(), Some("https://backend.internal"));
    }

    #[test]
    fn agent_container_references_git_provider_token() {
        let session = test_session();
        let config = test_config();
        let composed = compose(&session, &config);
        let agent = composed
            .pod
            .spec
            .unwrap()
            .containers
            .into_iter()
            .find(|c| c.name == "agent")
            .unwrap();
        let env = agent.env.unwrap();
        let token = env.iter().find(|e| e.name == "GIT_PROVIDER_TOKEN").unwrap();
        let secret_ref = token.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(secret_ref.name, credentials::GIT_PROVIDER_SECRET_NAME);
    }
}
