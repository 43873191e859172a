use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use foreman_types::Checkpoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    /// Relative path inside the workspace.
    path: String,
    /// False when the file did not exist at capture time; restore removes it.
    existed: bool,
    blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotManifest {
    entries: Vec<SnapshotEntry>,
}

/// Snapshots workspace files before they are first mutated by a run and can
/// restore them. One live checkpoint per run; restore is idempotent.
#[derive(Clone)]
pub struct CheckpointStore {
    snapshots_dir: PathBuf,
    workspace_root: PathBuf,
    live: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl CheckpointStore {
    pub async fn new(
        state_dir: impl AsRef<Path>,
        workspace_root: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let snapshots_dir = state_dir.as_ref().join("checkpoints");
        fs::create_dir_all(&snapshots_dir).await?;
        Ok(Self {
            snapshots_dir,
            workspace_root: workspace_root.as_ref().to_path_buf(),
            live: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Must succeed before the run's first mutating call; the orchestrator
    /// treats a failure here as fatal before any mutation happens.
    pub async fn create(&self, run_id: &str, reason: &str) -> anyhow::Result<Checkpoint> {
        {
            let live = self.live.read().await;
            if let Some(existing) = live.get(run_id) {
                return Ok(existing.clone());
            }
        }
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            reason: reason.to_string(),
            created_at: chrono::Utc::now(),
        };
        let dir = self.checkpoint_dir(&checkpoint.id);
        fs::create_dir_all(&dir).await?;
        self.write_manifest(&checkpoint.id, &SnapshotManifest::default())
            .await?;
        self.live
            .write()
            .await
            .insert(run_id.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    pub async fn live_for_run(&self, run_id: &str) -> Option<Checkpoint> {
        self.live.read().await.get(run_id).cloned()
    }

    /// Records the pre-mutation state of `path`. The first capture wins:
    /// later captures of the same path keep the original content so restore
    /// rewinds to checkpoint creation time, not to the latest mutation.
    pub async fn capture(&self, checkpoint_id: &str, path: &str) -> anyhow::Result<()> {
        let mut manifest = self.read_manifest(checkpoint_id).await?;
        if manifest.entries.iter().any(|e| e.path == path) {
            return Ok(());
        }
        let absolute = self.workspace_root.join(path);
        let blob = match fs::read_to_string(&absolute).await {
            Ok(content) => Some(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        manifest.entries.push(SnapshotEntry {
            path: path.to_string(),
            existed: blob.is_some(),
            blob,
        });
        self.write_manifest(checkpoint_id, &manifest).await
    }

    /// Rewinds every captured path to its snapshot state. Running it twice
    /// leaves the file set identical to running it once.
    pub async fn restore(&self, checkpoint_id: &str) -> anyhow::Result<Vec<String>> {
        let manifest = self.read_manifest(checkpoint_id).await?;
        let mut restored = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let absolute = self.workspace_root.join(&entry.path);
            if entry.existed {
                if let Some(parent) = absolute.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&absolute, entry.blob.as_deref().unwrap_or_default()).await?;
            } else {
                match fs::remove_file(&absolute).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            restored.push(entry.path.clone());
        }
        Ok(restored)
    }

    /// Drops the live checkpoint for a run once it is terminal.
    pub async fn release(&self, run_id: &str) {
        self.live.write().await.remove(run_id);
    }

    fn checkpoint_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.snapshots_dir.join(checkpoint_id)
    }

    async fn read_manifest(&self, checkpoint_id: &str) -> anyhow::Result<SnapshotManifest> {
        let path = self.checkpoint_dir(checkpoint_id).join("manifest.json");
        let raw = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_manifest(
        &self,
        checkpoint_id: &str,
        manifest: &SnapshotManifest,
    ) -> anyhow::Result<()> {
        let path = self.checkpoint_dir(checkpoint_id).join("manifest.json");
        let raw = serde_json::to_string_pretty(manifest)?;
        fs::write(&path, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(workspace: &Path) -> CheckpointStore {
        let state = workspace.join(".state");
        CheckpointStore::new(&state, workspace)
            .await
            .expect("checkpoint store")
    }

    #[tokio::test]
    async fn restore_rewinds_edits_and_removes_created_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path();
        fs::write(workspace.join("lib.rs"), "fn main() {}")
            .await
            .expect("seed file");

        let store = store(workspace).await;
        let checkpoint = store.create("run-1", "before first mutation").await.expect("create");

        store.capture(&checkpoint.id, "lib.rs").await.expect("capture existing");
        store.capture(&checkpoint.id, "new.rs").await.expect("capture absent");

        fs::write(workspace.join("lib.rs"), "fn main() { broken")
            .await
            .expect("mutate");
        fs::write(workspace.join("new.rs"), "pub fn added() {}")
            .await
            .expect("create");

        let restored = store.restore(&checkpoint.id).await.expect("restore");
        assert_eq!(restored.len(), 2);
        let content = fs::read_to_string(workspace.join("lib.rs")).await.expect("read");
        assert_eq!(content, "fn main() {}");
        assert!(!workspace.join("new.rs").exists());
    }

    #[tokio::test]
    async fn restore_twice_is_identical_to_restore_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path();
        fs::write(workspace.join("a.txt"), "original")
            .await
            .expect("seed");

        let store = store(workspace).await;
        let checkpoint = store.create("run-1", "snapshot").await.expect("create");
        store.capture(&checkpoint.id, "a.txt").await.expect("capture");

        fs::write(workspace.join("a.txt"), "mutated").await.expect("mutate");

        store.restore(&checkpoint.id).await.expect("first restore");
        let first = fs::read_to_string(workspace.join("a.txt")).await.expect("read");
        store.restore(&checkpoint.id).await.expect("second restore");
        let second = fs::read_to_string(workspace.join("a.txt")).await.expect("read");
        assert_eq!(first, second);
        assert_eq!(second, "original");
    }

    #[tokio::test]
    async fn first_capture_wins_for_a_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path();
        fs::write(workspace.join("a.txt"), "v1").await.expect("seed");

        let store = store(workspace).await;
        let checkpoint = store.create("run-1", "snapshot").await.expect("create");
        store.capture(&checkpoint.id, "a.txt").await.expect("capture v1");

        fs::write(workspace.join("a.txt"), "v2").await.expect("mutate");
        store.capture(&checkpoint.id, "a.txt").await.expect("recapture ignored");

        fs::write(workspace.join("a.txt"), "v3").await.expect("mutate again");
        store.restore(&checkpoint.id).await.expect("restore");
        let content = fs::read_to_string(workspace.join("a.txt")).await.expect("read");
        assert_eq!(content, "v1");
    }

    #[tokio::test]
    async fn one_live_checkpoint_per_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let first = store.create("run-1", "snapshot").await.expect("create");
        let second = store.create("run-1", "snapshot").await.expect("create again");
        assert_eq!(first.id, second.id);

        store.release("run-1").await;
        assert!(store.live_for_run("run-1").await.is_none());
    }
}
