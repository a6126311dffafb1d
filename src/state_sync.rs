//! State Persistence Coordinator (C5), sync-out and final-flush half (spec
//! §4.5). Runs as a long-lived sidecar: every `syncInterval` seconds it
//! pushes incremental changes under the scratch root's mirrored directories
//! up to the object store, respecting `maxSyncSize`; on SIGTERM/SIGINT it
//! performs one last sync-out before exiting so the pod's
//! `terminationGracePeriodSeconds` is enough to make the session resumable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::hydrate::{object_prefix, ARTIFACTS_DIR, CLAUDE_DIR, UPLOADS_DIR};
use crate::metrics::Metrics;

const MANIFEST_FILE: &str = ".sync-manifest.json";
const METADATA_FILE: &str = "metadata.json";

/// Path components that are never synced even inside a mirrored directory:
/// VCS metadata and build/dependency caches a session might accumulate
/// under `artifacts/` or `uploads/` (spec §4.5: "exclude ... build/cache
/// artifacts by pattern").
const EXCLUDED_COMPONENTS: [&str; 5] = [".git", "target", "node_modules", "__pycache__", ".cache"];

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct StateSyncConfig {
    pub namespace: String,
    pub session_name: String,
    pub scratch_root: PathBuf,
    pub sync_interval: Duration,
    pub max_sync_size_bytes: u64,
    pub object_store: Option<ObjectStoreConfig>,
}

impl StateSyncConfig {
    pub fn from_env() -> Result<Self, String> {
        let namespace = std::env::var("SESSION_NAMESPACE").map_err(|_| "SESSION_NAMESPACE must be set")?;
        let session_name = std::env::var("SESSION_NAME").map_err(|_| "SESSION_NAME must be set")?;
        let scratch_root = PathBuf::from(
            std::env::var("SCRATCH_ROOT").unwrap_or_else(|_| "/scratch".to_string()),
        );
        let sync_interval = Duration::from_secs(
            std::env::var("SYNC_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        );
        let max_sync_size_bytes = std::env::var("MAX_SYNC_SIZE_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1 << 30);
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

        Ok(StateSyncConfig {
            namespace,
            session_name,
            scratch_root,
            sync_interval,
            max_sync_size_bytes,
            object_store,
        })
    }
}

/// The set of top-level directories synced out; mirrors exactly the
/// hydrate side's `MIRRORED_DIRS` -- what comes down must be what goes
/// back up.
pub fn sync_roots() -> [&'static str; 3] {
    [CLAUDE_DIR, ARTIFACTS_DIR, UPLOADS_DIR]
}

/// Whether a path, relative to the scratch root, should be skipped by
/// sync-out. True if any path component matches a build/cache/VCS pattern.
pub fn is_excluded(relative: &Path) -> bool {
    relative.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        EXCLUDED_COMPONENTS.contains(&s.as_ref())
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    /// relative path -> sha256 hex digest last uploaded
    checksums: HashMap<String, String>,
}

fn load_manifest(scratch_root: &Path) -> Manifest {
    let path = scratch_root.join(MANIFEST_FILE);
    std::fs::read(&path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn save_manifest(scratch_root: &Path, manifest: &Manifest) -> Result<(), String> {
    let path = scratch_root.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec(manifest).map_err(|e| e.to_string())?;
    std::fs::write(path, bytes).map_err(|e| e.to_string())
}

pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Recursively lists every regular file under `root`'s mirrored
/// directories, returning paths relative to `root`. Pure I/O, no network;
/// kept separate from the upload loop so the walk/exclude logic is
/// independently testable against a real temp directory.
fn walk_sync_roots(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for top in sync_roots() {
        let dir = root.join(top);
        if dir.is_dir() {
            walk_dir(&dir, root, &mut out);
        }
    }
    out
}

fn walk_dir(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if is_excluded(relative) {
            continue;
        }
        if path.is_dir() {
            walk_dir(&path, root, out);
        } else if path.is_file() {
            out.push(relative.to_path_buf());
        }
    }
}

/// Splits candidate files into "changed since last sync" (by checksum) and
/// "unchanged", further truncating the changed set so its total byte size
/// never exceeds `max_sync_size_bytes` in one cycle. Returns the files to
/// upload, in deterministic path order, plus how many were skipped purely
/// due to the size cap (logged rather than silently dropped).
fn select_changed(
    root: &Path,
    candidates: &[PathBuf],
    manifest: &Manifest,
    max_sync_size_bytes: u64,
) -> (Vec<(PathBuf, String, Vec<u8>)>, usize) {
    let mut changed = Vec::new();
    for relative in candidates {
        let Ok(bytes) = std::fs::read(root.join(relative)) else {
            continue;
        };
        let digest = checksum(&bytes);
        let key = relative.to_string_lossy().to_string();
        if manifest.checksums.get(&key) != Some(&digest) {
            changed.push((relative.clone(), digest, bytes));
        }
    }
    changed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut budget = max_sync_size_bytes;
    let mut to_upload = Vec::new();
    let mut skipped = 0usize;
    for item in changed {
        let size = item.2.len() as u64;
        if size <= budget {
            budget -= size;
            to_upload.push(item);
        } else {
            skipped += 1;
        }
    }
    (to_upload, skipped)
}

#[derive(Debug, Serialize)]
struct SyncMetadata {
    timestamp: String,
    namespace: String,
    session: String,
    synced_count: usize,
}

/// Runs one sync-out cycle. Returns the number of files actually uploaded.
pub async fn sync_once(config: &StateSyncConfig) -> Result<usize, String> {
    let Some(store) = &config.object_store else {
        return Ok(0);
    };
    let client = build_s3_client(store).await;

    let mut manifest = load_manifest(&config.scratch_root);
    let candidates = walk_sync_roots(&config.scratch_root);
    let (to_upload, skipped) = select_changed(
        &config.scratch_root,
        &candidates,
        &manifest,
        config.max_sync_size_bytes,
    );

    if skipped > 0 {
        warn!(
            skipped,
            max_sync_size_bytes = config.max_sync_size_bytes,
            "sync-out cycle exceeded its size budget, deferring remaining files to next cycle"
        );
    }

    let prefix = object_prefix(&config.namespace, &config.session_name);
    for (relative, digest, bytes) in &to_upload {
        let key = format!("{prefix}{}", relative.to_string_lossy());
        client
            .put_object()
            .bucket(&store.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.clone()))
            .send()
            .await
            .map_err(|e| {
                record_s3_error(&config.namespace, "put", &config.session_name);
                format!("putting s3://{}/{key}: {e}", store.bucket)
            })?;
        manifest
            .checksums
            .insert(relative.to_string_lossy().to_string(), digest.clone());
    }

    if !to_upload.is_empty() {
        save_manifest(&config.scratch_root, &manifest)?;
    }

    write_metadata(&client, store, config, to_upload.len()).await?;
    info!(synced = to_upload.len(), skipped, "sync-out cycle complete");
    Ok(to_upload.len())
}

async fn write_metadata(
    client: &S3Client,
    store: &ObjectStoreConfig,
    config: &StateSyncConfig,
    synced_count: usize,
) -> Result<(), String> {
    let metadata = SyncMetadata {
        timestamp: Utc::now().to_rfc3339(),
        namespace: config.namespace.clone(),
        session: config.session_name.clone(),
        synced_count,
    };
    let body = serde_json::to_vec(&metadata).map_err(|e| e.to_string())?;
    let prefix = object_prefix(&config.namespace, &config.session_name);
    let key = format!("{prefix}{METADATA_FILE}");
    client
        .put_object()
        .bucket(&store.bucket)
        .key(&key)
        .body(ByteStream::from(body))
        .send()
        .await
        .map_err(|e| {
            record_s3_error(&config.namespace, "put", &config.session_name);
            format!("putting s3://{}/{key}: {e}", store.bucket)
        })?;
    Ok(())
}

/// Increments the object-store error counter (§4.6/§7 class-2: "transient
/// object-store errors are counted, not reflected in session phase").
fn record_s3_error(namespace: &str, operation: &str, session: &str) {
    Metrics::get()
        .s3_errors
        .with_label_values(&[namespace, operation, session])
        .inc();
}

async fn build_s3_client(store: &ObjectStoreConfig) -> S3Client {
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::{Builder, Credentials, Region};

    let credentials = Credentials::new(
        store.access_key_id.clone(),
        store.secret_access_key.clone(),
        None,
        None,
        "session-controller-state-sync",
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

/// Drives the periodic sync loop until SIGTERM/SIGINT, then performs one
/// final flush before returning. Mirrors the `shutdown_signal` pattern used
/// elsewhere in this stack for graceful-shutdown binaries.
pub async fn run(config: &StateSyncConfig) -> Result<(), String> {
    let mut interval = tokio::time::interval(config.sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| format!("install SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| format!("install SIGINT handler: {e}"))?;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(error) = sync_once(config).await {
                    warn!(%error, "sync-out cycle failed, will retry next interval");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, performing final flush");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, performing final flush");
                break;
            }
        }
    }

    if let Err(error) = sync_once(config).await {
        warn!(%error, "final flush failed");
        return Err(error);
    }
    info!("final flush complete, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_excluded_matches_git_and_build_cache_dirs() {
        assert!(is_excluded(Path::new("artifacts/build/.git/HEAD")));
        assert!(is_excluded(Path::new("uploads/app/node_modules/pkg/index.js")));
        assert!(is_excluded(Path::new("artifacts/target/debug/bin")));
        assert!(!is_excluded(Path::new("artifacts/build/output.tar")));
    }

    #[test]
    fn checksum_is_stable_for_same_bytes() {
        assert_eq!(checksum(b"hello"), checksum(b"hello"));
        assert_ne!(checksum(b"hello"), checksum(b"world"));
    }

    #[test]
    fn select_changed_skips_unmodified_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join(CLAUDE_DIR)).unwrap();
        std::fs::write(root.join(CLAUDE_DIR).join("a.txt"), b"same").unwrap();
        std::fs::write(root.join(CLAUDE_DIR).join("b.txt"), b"changed").unwrap();

        let mut manifest = Manifest::default();
        manifest
            .checksums
            .insert(format!("{CLAUDE_DIR}/a.txt"), checksum(b"same"));
        manifest
            .checksums
            .insert(format!("{CLAUDE_DIR}/b.txt"), checksum(b"old-content"));

        let candidates = vec![
            PathBuf::from(format!("{CLAUDE_DIR}/a.txt")),
            PathBuf::from(format!("{CLAUDE_DIR}/b.txt")),
        ];
        let (to_upload, skipped) = select_changed(root, &candidates, &manifest, 1 << 20);
        assert_eq!(skipped, 0);
        assert_eq!(to_upload.len(), 1);
        assert_eq!(to_upload[0].0, PathBuf::from(format!("{CLAUDE_DIR}/b.txt")));
    }

    #[test]
    fn select_changed_respects_size_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join(ARTIFACTS_DIR)).unwrap();
        std::fs::write(root.join(ARTIFACTS_DIR).join("big.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(root.join(ARTIFACTS_DIR).join("small.bin"), vec![0u8; 10]).unwrap();

        let candidates = vec![
            PathBuf::from(format!("{ARTIFACTS_DIR}/big.bin")),
            PathBuf::from(format!("{ARTIFACTS_DIR}/small.bin")),
        ];
        let (to_upload, skipped) = select_changed(root, &candidates, &Manifest::default(), 50);
        assert_eq!(to_upload.len(), 1);
        assert_eq!(to_upload[0].0, PathBuf::from(format!("{ARTIFACTS_DIR}/small.bin")));
        assert_eq!(skipped, 1);
    }

    #[test]
    fn walk_sync_roots_only_covers_mirrored_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join(CLAUDE_DIR)).unwrap();
        std::fs::create_dir_all(root.join("repos/app")).unwrap();
        std::fs::write(root.join(CLAUDE_DIR).join("session.json"), b"{}").unwrap();
        std::fs::write(root.join("repos/app/README.md"), b"hi").unwrap();

        let found = walk_sync_roots(root);
        assert_eq!(found, vec![PathBuf::from(format!("{CLAUDE_DIR}/session.json"))]);
    }
}
