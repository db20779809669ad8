use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("checkpoint corrupt at {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Durable per-run bookkeeping of item outcomes, keyed by `(operation_kind,
/// operation_id)`. A durable on-disk counterpart to an in-memory TTL cache,
/// since orchestrator runs must resume across process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_items: HashSet<String>,
    pub failed_items: HashMap<String, String>,
    pub skipped_items: HashMap<String, String>,
    pub total_items: usize,
    pub metadata: HashMap<String, String>,
}

impl Checkpoint {
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            ..Default::default()
        }
    }

    pub fn mark_completed(&mut self, item: impl Into<String>) {
        self.completed_items.insert(item.into());
    }

    pub fn mark_failed(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.failed_items.insert(item.into(), reason.into());
    }

    pub fn mark_skipped(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.skipped_items.insert(item.into(), reason.into());
    }

    /// Items in `candidates` not yet completed, failed, or skipped.
    pub fn remaining<'a>(&self, candidates: &'a [String]) -> Vec<&'a String> {
        candidates
            .iter()
            .filter(|id| !self.completed_items.contains(*id) && !self.failed_items.contains_key(*id) && !self.skipped_items.contains_key(*id))
            .collect()
    }
}

pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, kind: &str, operation_id: &str) -> PathBuf {
        self.base_dir.join(format!("{kind}-{operation_id}.checkpoint.json"))
    }

    /// Loads a checkpoint, returning `None` for a missing file and logging
    /// (not erroring on) a corrupt one — checkpoint corruption is a
    /// warning, proceed without resume.
    pub async fn load(&self, kind: &str, operation_id: &str) -> Option<Checkpoint> {
        let path = self.path_for(kind, operation_id);
        let body = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&body) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint corrupt, proceeding without resume");
                None
            }
        }
    }

    pub async fn save(&self, kind: &str, operation_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let _ = fs::create_dir_all(&self.base_dir).await;
        let path = self.path_for(kind, operation_id);
        let body = serde_json::to_vec_pretty(checkpoint).map_err(|e| CheckpointError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &body).await.map_err(|e| CheckpointError::Io {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        fs::rename(&tmp_path, &path).await.map_err(|e| CheckpointError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    pub async fn delete(&self, kind: &str, operation_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(kind, operation_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut checkpoint = Checkpoint::new(3);
        checkpoint.mark_completed("a");
        checkpoint.mark_failed("b", "registry timeout");
        store.save("delete", "op1", &checkpoint).await.unwrap();
        let loaded = store.load("delete", "op1").await.unwrap();
        assert_eq!(loaded.completed_items, checkpoint.completed_items);
        assert_eq!(loaded.failed_items, checkpoint.failed_items);
    }

    #[tokio::test]
    async fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("delete", "unknown").await.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_for_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.delete("delete", "op1").await.unwrap();
    }

    #[test]
    fn remaining_excludes_completed_failed_and_skipped() {
        let mut checkpoint = Checkpoint::new(4);
        checkpoint.mark_completed("a");
        checkpoint.mark_failed("b", "err");
        checkpoint.mark_skipped("c", "in_use");
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let remaining = checkpoint.remaining(&candidates);
        assert_eq!(remaining, vec![&"d".to_string()]);
    }
}
