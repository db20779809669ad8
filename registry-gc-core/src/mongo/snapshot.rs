use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::mongo::aggregator::MongoUsageAggregator;
use crate::mongo::errors::MongoUsageError;
use crate::mongo::models::UsageFact;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub taken_at: DateTime<Utc>,
    pub facts: Vec<UsageFact>,
}

impl UsageSnapshot {
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        Utc::now() - self.taken_at <= max_age
    }
}

/// Single consolidated snapshot with a declared freshness window.
/// Readers try the configured path first, then search for the most recent
/// timestamped variant, persisted with the same atomic
/// write-then-rename durability as the checkpoint store.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn timestamped_path(&self, taken_at: DateTime<Utc>) -> PathBuf {
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("usage-snapshot");
        let ext = self.path.extension().and_then(|s| s.to_str()).unwrap_or("json");
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!("{stem}-{}.{ext}", taken_at.format("%Y%m%dT%H%M%SZ")))
    }

    pub async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), MongoUsageError> {
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| MongoUsageError::Deserialize(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &body)
            .await
            .map_err(|e| MongoUsageError::SnapshotWrite {
                path: tmp_path.display().to_string(),
                source: e,
            })?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| MongoUsageError::SnapshotWrite {
                path: self.path.display().to_string(),
                source: e,
            })?;
        let timestamped = self.timestamped_path(snapshot.taken_at);
        let _ = fs::write(&timestamped, &body).await;
        Ok(())
    }

    pub async fn load_latest(&self) -> Result<UsageSnapshot, MongoUsageError> {
        if let Ok(body) = fs::read(&self.path).await {
            return serde_json::from_slice(&body).map_err(|e| MongoUsageError::Deserialize(e.to_string()));
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("usage-snapshot");
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|_| MongoUsageError::SnapshotNotFound {
                path: self.path.display().to_string(),
            })?;
        let mut candidates = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(stem) {
                    candidates.push(entry.path());
                }
            }
        }
        candidates.sort();
        let most_recent = candidates.pop().ok_or_else(|| MongoUsageError::SnapshotNotFound {
            path: self.path.display().to_string(),
        })?;
        let body = fs::read(&most_recent).await.map_err(|e| MongoUsageError::SnapshotWrite {
            path: most_recent.display().to_string(),
            source: e,
        })?;
        serde_json::from_slice(&body).map_err(|e| MongoUsageError::Deserialize(e.to_string()))
    }

    /// Returns a snapshot no older than `max_age`, re-running all seven
    /// pipelines through `aggregator` and persisting the result when the
    /// existing snapshot is stale or absent.
    pub async fn ensure_fresh(
        &self,
        aggregator: &MongoUsageAggregator,
        max_age: Duration,
    ) -> Result<UsageSnapshot, MongoUsageError> {
        if let Ok(existing) = self.load_latest().await {
            if existing.is_fresh(max_age) {
                info!("usage snapshot still fresh, skipping re-aggregation");
                return Ok(existing);
            }
            warn!("usage snapshot stale, re-running aggregation pipelines");
        }
        let facts = aggregator.aggregate_all().await?;
        let snapshot = UsageSnapshot {
            taken_at: Utc::now(),
            facts,
        };
        self.save(&snapshot).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mongo::models::{ConfigUsage, UsageFact};

    fn sample_snapshot(taken_at: DateTime<Utc>) -> UsageSnapshot {
        UsageSnapshot {
            taken_at,
            facts: vec![UsageFact::Project(ConfigUsage {
                environment_docker_tag: "abc".into(),
                reference_id: "1".into(),
                reference_name: "proj".into(),
            })],
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("usage-snapshot.json"));
        let snapshot = sample_snapshot(Utc::now());
        store.save(&snapshot).await.unwrap();
        let loaded = store.load_latest().await.unwrap();
        assert_eq!(loaded.facts.len(), snapshot.facts.len());
        assert_eq!(loaded.taken_at, snapshot.taken_at);
    }

    #[tokio::test]
    async fn falls_back_to_most_recent_timestamped_variant_when_primary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("usage-snapshot.json"));
        let snapshot = sample_snapshot(Utc::now());
        store.save(&snapshot).await.unwrap();
        fs::remove_file(dir.path().join("usage-snapshot.json")).await.unwrap();
        let loaded = store.load_latest().await.unwrap();
        assert_eq!(loaded.facts.len(), 1);
    }

    #[test]
    fn freshness_window_respects_max_age() {
        let snapshot = sample_snapshot(Utc::now() - Duration::hours(30));
        assert!(!snapshot.is_fresh(Duration::hours(24)));
        let fresh = sample_snapshot(Utc::now() - Duration::hours(2));
        assert!(fresh.is_fresh(Duration::hours(24)));
    }
}
