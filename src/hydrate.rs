//! State Persistence Coordinator (C5), hydrate half (spec §4.5).
//!
//! Runs as the pod's init container: lays out the scratch volume, mirrors
//! any prior session state down from the object store, then clones the
//! input repositories and the active workflow. Exits zero once done so the
//! agent container is allowed to start (the ordering guarantee is a
//! property of the pod spec -- `initContainers` -- not of this binary).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use aws_sdk_s3::Client as S3Client;
use tokio::process::Command;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::resource::{InputRepo, WorkflowRef};

pub const CLAUDE_DIR: &str = ".claude";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const UPLOADS_DIR: &str = "uploads";
pub const REPOS_DIR: &str = "repos";
pub const WORKFLOWS_DIR: &str = "workflows";

/// Sub-paths mirrored to and from the object store; everything else under
/// the scratch root (cloned repos, the workflow checkout) is reconstructed
/// fresh on every hydrate rather than round-tripped through S3.
pub const MIRRORED_DIRS: [&str; 3] = [CLAUDE_DIR, ARTIFACTS_DIR, UPLOADS_DIR];

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct HydrateConfig {
    pub namespace: String,
    pub session_name: String,
    pub scratch_root: PathBuf,
    pub repos: Vec<InputRepo>,
    pub workflow: Option<WorkflowRef>,
    pub object_store: Option<ObjectStoreConfig>,
}

impl HydrateConfig {
    pub fn from_env() -> Result<Self, String> {
        let namespace = require_env("SESSION_NAMESPACE")?;
        let session_name = require_env("SESSION_NAME")?;
        let scratch_root = PathBuf::from(
            std::env::var("SCRATCH_ROOT").unwrap_or_else(|_| "/scratch".to_string()),
        );
        let repos: Vec<InputRepo> = match std::env::var("INPUT_REPOS_JSON") {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| format!("INPUT_REPOS_JSON: {e}"))?,
            Err(_) => Vec::new(),
        };
        let workflow = std::env::var("WORKFLOW_URL").ok().map(|url| WorkflowRef {
            url,
            branch: std::env::var("WORKFLOW_BRANCH").unwrap_or_else(|_| "main".to_string()),
            sub_path: std::env::var("WORKFLOW_SUB_PATH").ok(),
        });
        let object_store = match (
            std::env::var("OBJECT_STORE_ENDPOINT").ok(),
            std::env::var("OBJECT_STORE_BUCKET").ok(),
        ) {
            (Some(endpoint), Some(bucket)) => Some(ObjectStoreConfig {
                endpoint,
                bucket,
                region: std::env::var("OBJECT_STORE_REGION").ok(),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(HydrateConfig {
            namespace,
            session_name,
            scratch_root,
            repos,
            workflow,
            object_store,
        })
    }
}

fn require_env(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("{key} must be set"))
}

/// Flat object-store prefix this session's state lives under (spec §6).
pub fn object_prefix(namespace: &str, session_name: &str) -> String {
    format!("{namespace}/{session_name}/")
}

/// Runs the full hydrate sequence. Repo and workflow clone failures are
/// logged and swallowed (spec §4.5: "failures are non-fatal"); only a
/// failure to lay out the scratch volume or to talk to a *configured*
/// object store is fatal, since those make the session un-resumable.
pub async fn run(config: &HydrateConfig) -> Result<(), String> {
    create_scratch_layout(&config.scratch_root)?;

    if let Some(store) = &config.object_store {
        let client = build_s3_client(store).await;
        mirror_from_object_store(&client, store, config).await?;
    } else {
        info!("no object store configured, starting from empty scratch layout");
    }

    for repo in &config.repos {
        if let Err(error) = clone_repo(&config.scratch_root, repo).await {
            warn!(repo = %repo.name, %error, "failed to clone input repository, continuing");
        }
    }

    if let Some(workflow) = &config.workflow {
        if let Err(error) = clone_workflow(&config.scratch_root, workflow).await {
            warn!(url = %workflow.url, %error, "failed to clone workflow repository, continuing");
        }
    }

    Ok(())
}

/// Creates the directories every container in the pod needs, with
/// permissions both the (root-ish) init container and the unprivileged
/// agent container can write through. The pod's `fsGroup` handles ownership;
/// this only has to make sure group-write bits are set since `EmptyDir`
/// volumes default to the creating process's umask.
fn create_scratch_layout(root: &Path) -> Result<(), String> {
    for dir in [CLAUDE_DIR, ARTIFACTS_DIR, UPLOADS_DIR, REPOS_DIR, WORKFLOWS_DIR] {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).map_err(|e| format!("creating {}: {e}", path.display()))?;
        set_group_writable(&path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_group_writable(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| format!("stat {}: {e}", path.display()))?
        .permissions();
    perms.set_mode(0o2775);
    std::fs::set_permissions(path, perms).map_err(|e| format!("chmod {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn set_group_writable(_path: &Path) -> Result<(), String> {
    Ok(())
}

async fn build_s3_client(store: &ObjectStoreConfig) -> S3Client {
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::{Builder, Credentials, Region};

    let credentials = Credentials::new(
        store.access_key_id.clone(),
        store.secret_access_key.clone(),
        None,
        None,
        "session-controller-hydrate",
    );
    let region = Region::new(store.region.clone().unwrap_or_else(|| "us-east-1".to_string()));
    let config = Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(region)
        .endpoint_url(&store.endpoint)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    S3Client::from_conf(config)
}

/// Mirrors `${bucket}/${namespace}/${sessionName}/` into the scratch root.
/// An empty listing (no prior state) is not an error -- the session simply
/// starts from an empty layout, per spec §4.5.
async fn mirror_from_object_store(
    client: &S3Client,
    store: &ObjectStoreConfig,
    config: &HydrateConfig,
) -> Result<(), String> {
    let prefix = object_prefix(&config.namespace, &config.session_name);
    let mut continuation_token = None;
    let mut downloaded = 0usize;

    loop {
        let mut request = client.list_objects_v2().bucket(&store.bucket).prefix(&prefix);
        if let Some(token) = continuation_token.take() {
            request = request.continuation_token(token);
        }
        let page = request.send().await.map_err(|e| {
            record_s3_error(&config.namespace, "list", &config.session_name);
            format!("listing s3://{}/{prefix}: {e}", store.bucket)
        })?;

        for object in page.contents() {
            let Some(key) = object.key() else { continue };
            let Some(relative) = key.strip_prefix(&prefix) else { continue };
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            download_object(client, &store.bucket, key, config, relative).await?;
            downloaded += 1;
        }

        if page.is_truncated().unwrap_or(false) {
            continuation_token = page.next_continuation_token().map(str::to_string);
        } else {
            break;
        }
    }

    info!(downloaded, %prefix, "mirrored prior session state from object store");
    Ok(())
}

async fn download_object(
    client: &S3Client,
    bucket: &str,
    key: &str,
    config: &HydrateConfig,
    relative: &str,
) -> Result<(), String> {
    let response = client.get_object().bucket(bucket).key(key).send().await.map_err(|e| {
        record_s3_error(&config.namespace, "get", &config.session_name);
        format!("getting s3://{bucket}/{key}: {e}")
    })?;
    let bytes = response
        .body
        .collect()
        .await
        .map_err(|e| {
            record_s3_error(&config.namespace, "get", &config.session_name);
            format!("reading s3://{bucket}/{key}: {e}")
        })?
        .into_bytes();

    let dest = config.scratch_root.join(relative);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("creating {}: {e}", parent.display()))?;
    }
    std::fs::write(&dest, &bytes).map_err(|e| format!("writing {}: {e}", dest.display()))
}

/// Increments the object-store error counter (§4.6/§7 class-2: "transient
/// object-store errors are counted, not reflected in session phase").
fn record_s3_error(namespace: &str, operation: &str, session: &str) {
    Metrics::get()
        .s3_errors
        .with_label_values(&[namespace, operation, session])
        .inc();
}

/// Builds the `git clone` argument list for a shallow, single-branch clone
/// of one input repository. Exposed as a pure function so the exact
/// invocation can be unit tested without shelling out.
pub fn clone_args(repo: &InputRepo, dest: &Path) -> Vec<String> {
    vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--single-branch".to_string(),
        "--branch".to_string(),
        repo.branch.clone(),
        repo.url.clone(),
        dest.display().to_string(),
    ]
}

async fn clone_repo(scratch_root: &Path, repo: &InputRepo) -> Result<(), String> {
    let dest = scratch_root.join(REPOS_DIR).join(&repo.name);
    run_git(&clone_args(repo, &dest)).await
}

async fn clone_workflow(scratch_root: &Path, workflow: &WorkflowRef) -> Result<(), String> {
    let dest = scratch_root.join(WORKFLOWS_DIR);
    let fake_repo = InputRepo {
        name: String::new(),
        url: workflow.url.clone(),
        branch: workflow.branch.clone(),
    };

    match &workflow.sub_path {
        None => run_git(&clone_args(&fake_repo, &dest)).await,
        Some(sub_path) => {
            let tmp = dest.with_extension("checkout-tmp");
            run_git(&clone_args(&fake_repo, &tmp)).await?;
            let source = tmp.join(sub_path);
            if !source.exists() {
                let _ = std::fs::remove_dir_all(&tmp);
                return Err(format!("sub-path {sub_path} not found in workflow checkout"));
            }
            copy_dir_recursive(&source, &dest)?;
            std::fs::remove_dir_all(&tmp).map_err(|e| format!("cleaning up {}: {e}", tmp.display()))
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dst).map_err(|e| format!("creating {}: {e}", dst.display()))?;
    for entry in std::fs::read_dir(src).map_err(|e| format!("reading {}: {e}", src.display()))? {
        let entry = entry.map_err(|e| e.to_string())?;
        let dest_path = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

async fn run_git(args: &[String]) -> Result<(), String> {
    let output = Command::new("git")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("spawning git: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "git {:?} exited with {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_prefix_is_namespace_then_session() {
        assert_eq!(object_prefix("team-a", "demo"), "team-a/demo/");
    }

    #[test]
    fn clone_args_requests_shallow_single_branch() {
        let repo = InputRepo {
            name: "app".to_string(),
            url: "https://example.com/app.git".to_string(),
            branch: "release".to_string(),
        };
        let args = clone_args(&repo, Path::new("/scratch/repos/app"));
        assert_eq!(
            args,
            vec![
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                "release",
                "https://example.com/app.git",
                "/scratch/repos/app",
            ]
        );
    }

    #[test]
    fn mirrored_dirs_matches_object_store_layout() {
        assert_eq!(MIRRORED_DIRS, [CLAUDE_DIR, ARTIFACTS_DIR, UPLOADS_DIR]);
    }

    #[test]
    fn create_scratch_layout_makes_all_expected_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        create_scratch_layout(tmp.path()).unwrap();
        for dir in [CLAUDE_DIR, ARTIFACTS_DIR, UPLOADS_DIR, REPOS_DIR, WORKFLOWS_DIR] {
            assert!(tmp.path().join(dir).is_dir());
        }
    }
}
