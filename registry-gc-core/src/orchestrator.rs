use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bson::doc;
use futures_util::stream::TryStreamExt;
use mongodb::Database;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::backup::{BackupAdapter, BackupError};
use crate::candidates::Candidate;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::cluster::RegistryDeleteModeToggle;
use crate::layer_graph::ImageType;
use crate::mongo::errors::MongoUsageError;
use crate::mongo::models::UsageFact;
use crate::mongo::models::{RevisionRecord, VersionRecord};
use crate::registry::{RegistryError, RegistryOperations};
use crate::tag_resolver::RecordType;
use crate::usage_resolver::UsageResolver;

const DELETION_OPERATION_KIND: &str = "deletion";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Mongo(#[from] MongoUsageError),
    #[error("backup failed, aborting before any registry deletions: {0}")]
    BackupAborted(#[from] BackupError),
}

/// One unique `(image_type, tag)` pair pending deletion, carrying every
/// archived/orphan ID that independently resolved to it — a tag appears
/// at most once even when produced by multiple matching archived IDs, but
/// every such ID must still be remembered for the conditional Mongo cleanup.
#[derive(Debug, Clone)]
struct DeletionItem {
    image_type: ImageType,
    tag: String,
    object_ids: Vec<(String, RecordType)>,
}

impl DeletionItem {
    fn key(&self) -> String {
        format!("{}:{}", self.image_type.repository_segment(), self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub candidates: Vec<Candidate>,
    pub repository_base: String,
    pub backup: bool,
    pub recency_days: Option<i64>,
    pub cluster_delete_mode: bool,
    pub resume: bool,
    pub operation_id: String,
    pub mongo_cleanup: bool,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DeletionResult {
    pub images_backed_up: usize,
    pub docker_images_deleted: usize,
    pub mongo_records_cleaned: usize,
    pub failed: Vec<FailedItem>,
    pub skipped_in_use: Vec<SkippedItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub tag: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub tag: String,
    pub usage_summary: String,
}

/// The apply-mode pipeline: cloned-revision closure, a live
/// in-use re-check, dedup, checkpoint scoping, the final in-use gate,
/// optional backup, transient delete-mode enable/disable, parallel
/// deletion, and conditional Mongo cleanup.
pub struct DeletionOrchestrator {
    registry: Arc<dyn RegistryOperations>,
    db: Database,
    checkpoints: CheckpointStore,
    cluster_toggle: Option<RegistryDeleteModeToggle>,
    backup_adapter: Option<Arc<BackupAdapter>>,
}

impl DeletionOrchestrator {
    pub fn new(
        registry: Arc<dyn RegistryOperations>,
        db: Database,
        checkpoints: CheckpointStore,
        cluster_toggle: Option<RegistryDeleteModeToggle>,
        backup_adapter: Option<Arc<BackupAdapter>>,
    ) -> Self {
        Self {
            registry,
            db,
            checkpoints,
            cluster_toggle,
            backup_adapter,
        }
    }

    /// Stage 1: drop any candidate revision whose `clonedEnvironmentRevisionId`
    /// points outside the candidate set, and drop its parent environment too.
    /// Cycle-safe via a seen-set; follows chains transitively.
    async fn cloned_revision_closure(&self, candidates: Vec<Candidate>) -> Result<Vec<Candidate>, OrchestratorError> {
        let revisions = self.db.collection::<RevisionRecord>("environment_revisions");
        let mut revisions_by_id: HashMap<String, RevisionRecord> = HashMap::new();
        let mut cursor = revisions.find(doc! {}).await?;
        while let Some(r) = cursor.try_next().await? {
            revisions_by_id.insert(r.id.clone(), r);
        }

        let candidate_ids: HashSet<&str> = candidates.iter().map(|c| c.object_id.as_str()).collect();

        let mut dropped: HashSet<String> = HashSet::new();
        for candidate in &candidates {
            if candidate.record_type != RecordType::Revision {
                continue;
            }
            let Some(revision) = revisions_by_id.get(&candidate.object_id) else {
                continue;
            };
            let mut seen = HashSet::new();
            let mut cursor_id = revision.cloned_environment_revision_id.clone();
            let mut chain_satisfied = true;
            while let Some(pointed_id) = cursor_id {
                if !seen.insert(pointed_id.clone()) {
                    break; // cycle, treat as satisfied (already-visited chain)
                }
                if !candidate_ids.contains(pointed_id.as_str()) {
                    chain_satisfied = false;
                    break;
                }
                let Some(pointed) = revisions_by_id.get(&pointed_id) else {
                    break;
                };
                if !candidate_ids.contains(pointed.environment_id.as_str()) {
                    chain_satisfied = false;
                    break;
                }
                cursor_id = pointed.cloned_environment_revision_id.clone();
            }
            if !chain_satisfied {
                dropped.insert(candidate.object_id.clone());
                dropped.insert(revision.environment_id.clone());
            }
        }

        if !dropped.is_empty() {
            info!(count = dropped.len(), "dropped candidates failing cloned-revision closure");
        }
        Ok(candidates.into_iter().filter(|c| !dropped.contains(&c.object_id)).collect())
    }

    /// Stage 2: drop any candidate still directly referenced by a live
    /// workspace/session or a user's default environment, independent of
    /// archive status.
    async fn drop_live_referenced(&self, candidates: Vec<Candidate>) -> Result<Vec<Candidate>, OrchestratorError> {
        let mut referenced: HashSet<String> = HashSet::new();
        for (collection, fields) in [
            ("workspace", &["environmentId", "environmentRevisionId"][..]),
            ("workspace_session", &["environmentId", "environmentRevisionId"][..]),
        ] {
            let coll = self.db.collection::<bson::Document>(collection);
            let mut cursor = coll.find(doc! {}).await?;
            while let Some(doc) = cursor.try_next().await? {
                for field in fields {
                    if let Ok(id) = doc.get_str(field) {
                        referenced.insert(id.to_string());
                    }
                }
            }
        }
        let prefs = self.db.collection::<bson::Document>("userPreferences");
        let mut cursor = prefs.find(doc! {}).await?;
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(id) = doc.get_str("defaultEnvironmentId") {
                referenced.insert(id.to_string());
            }
        }

        Ok(candidates.into_iter().filter(|c| !referenced.contains(&c.object_id)).collect())
    }

    /// Stage 3: group candidates into unique `(image_type, tag)` deletion
    /// items, remembering every archived ID that resolved to each one.
    fn group_by_image(candidates: Vec<Candidate>) -> Vec<DeletionItem> {
        let mut by_key: HashMap<(ImageType, String), DeletionItem> = HashMap::new();
        for candidate in candidates {
            let key = (candidate.image_type, candidate.tag.clone());
            let entry = by_key.entry(key).or_insert_with(|| DeletionItem {
                image_type: candidate.image_type,
                tag: candidate.tag.clone(),
                object_ids: Vec::new(),
            });
            entry.object_ids.push((candidate.object_id.clone(), candidate.record_type));
        }
        by_key.into_values().collect()
    }

    /// Runs the full apply pipeline and returns the structured result.
    pub async fn apply(&self, request: DeletionRequest, usage_facts: &[UsageFact]) -> Result<DeletionResult, OrchestratorError> {
        let candidates = self.cloned_revision_closure(request.candidates).await?;
        let candidates = self.drop_live_referenced(candidates).await?;
        let mut items = Self::group_by_image(candidates);

        let mut checkpoint = if request.resume {
            self.checkpoints
                .load(DELETION_OPERATION_KIND, &request.operation_id)
                .await
                .unwrap_or_else(|| Checkpoint::new(items.len()))
        } else {
            Checkpoint::new(items.len())
        };
        if request.resume {
            let keys: Vec<String> = items.iter().map(|i| i.key()).collect();
            let remaining: HashSet<String> = checkpoint.remaining(&keys).into_iter().cloned().collect();
            items.retain(|i| remaining.contains(&i.key()));
        }

        let usage_resolver = UsageResolver::new(usage_facts);
        let mut result = DeletionResult::default();
        let mut surviving = Vec::new();
        for item in items {
            let record = usage_resolver.resolve(&item.tag, request.recency_days);
            if record.in_use {
                checkpoint.mark_skipped(item.key(), record.usage_summary.clone());
                result.skipped_in_use.push(SkippedItem {
                    tag: item.tag.clone(),
                    usage_summary: record.usage_summary,
                });
            } else {
                surviving.push(item);
            }
        }

        if request.backup {
            if let Some(adapter) = &self.backup_adapter {
                let mut by_repo: HashMap<String, Vec<String>> = HashMap::new();
                for item in &surviving {
                    let repo = format!("{}/{}", request.repository_base, item.image_type.repository_segment());
                    by_repo.entry(repo).or_default().push(item.tag.clone());
                }
                let mut backed_up = 0;
                for (repo, tags) in &by_repo {
                    backed_up += adapter.backup_tags(repo, tags).await?;
                }
                result.images_backed_up = backed_up;
            }
        }

        if request.cluster_delete_mode {
            if let Some(toggle) = &self.cluster_toggle {
                toggle.enable().await;
            }
        }
        let delete_outcome = self
            .delete_all(&request, surviving, &mut checkpoint)
            .await;
        if request.cluster_delete_mode {
            if let Some(toggle) = &self.cluster_toggle {
                toggle.disable().await;
            }
        }
        let (deleted_count, successfully_deleted_ids, failed) = delete_outcome;
        result.docker_images_deleted = deleted_count;
        result.failed = failed;

        if request.mongo_cleanup {
            result.mongo_records_cleaned = self.cleanup_mongo(&successfully_deleted_ids).await?;
        }

        self.checkpoints.save(DELETION_OPERATION_KIND, &request.operation_id, &checkpoint).await.ok();
        // Clean completion: zero unprocessed items and nothing left
        // to retry. Skipped-in-use items are terminal, not pending work.
        if checkpoint.failed_items.is_empty() {
            self.checkpoints.delete(DELETION_OPERATION_KIND, &request.operation_id).await.ok();
        }

        Ok(result)
    }

    /// Stage 8: deletes every surviving item with up to
    /// `min(configured_workers, unique_images, 10)` workers, checkpointing
    /// every 10 completions and once at the end. Returns the count deleted,
    /// the set of archived IDs eligible for Mongo cleanup, and the failures.
    async fn delete_all(
        &self,
        request: &DeletionRequest,
        items: Vec<DeletionItem>,
        checkpoint: &mut Checkpoint,
    ) -> (usize, HashSet<(String, RecordType)>, Vec<FailedItem>) {
        let worker_count = request.max_workers.min(items.len().max(1)).min(10).max(1);
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let completed_counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            let repository_base = request.repository_base.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let repository = format!("{}/{}", repository_base, item.image_type.repository_segment());
                let outcome = registry.delete(&repository, &item.tag).await;
                (item, outcome)
            }));
        }

        let mut deleted_count = 0;
        let mut successfully_deleted_ids = HashSet::new();
        let mut failed = Vec::new();
        for handle in handles {
            // A joined task that panicked is recorded as a failed item rather
            // than propagated: the delete-mode disable in `apply` must still
            // run even if one worker crashed mid-batch.
            match handle.await {
                Ok((item, outcome)) => match outcome {
                    Ok(_deleted_or_already_gone) => {
                        deleted_count += 1;
                        successfully_deleted_ids.extend(item.object_ids.iter().cloned());
                        checkpoint.mark_completed(item.key());
                    }
                    Err(e) => {
                        warn!(tag = %item.tag, error = %e, "registry deletion failed");
                        checkpoint.mark_failed(item.key(), e.to_string());
                        failed.push(FailedItem {
                            tag: item.tag.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
                Err(join_err) => {
                    warn!(error = %join_err, "deletion worker task panicked");
                    failed.push(FailedItem {
                        tag: "<unknown, worker panicked>".to_string(),
                        reason: join_err.to_string(),
                    });
                }
            }
            let n = completed_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 10 == 0 {
                self.checkpoints
                    .save(DELETION_OPERATION_KIND, &request.operation_id, checkpoint)
                    .await
                    .ok();
            }
        }

        (deleted_count, successfully_deleted_ids, failed)
    }

    /// Stage 9: conditional Mongo cleanup honoring referential-integrity
    /// guards per record type.
    async fn cleanup_mongo(&self, successfully_deleted_ids: &HashSet<(String, RecordType)>) -> Result<usize, OrchestratorError> {
        let mut cleaned = 0;

        for (id, record_type) in successfully_deleted_ids {
            match record_type {
                RecordType::Version => {
                    self.db
                        .collection::<VersionRecord>("model_versions")
                        .delete_one(doc! { "_id": id })
                        .await?;
                    cleaned += 1;
                }
                RecordType::Revision => {
                    if self.revision_still_referenced(id).await? {
                        continue;
                    }
                    self.db
                        .collection::<RevisionRecord>("environment_revisions")
                        .delete_one(doc! { "_id": id })
                        .await?;
                    cleaned += 1;
                }
                RecordType::Model => {
                    let still_has_versions = self
                        .db
                        .collection::<VersionRecord>("model_versions")
                        .count_documents(doc! { "modelId.value": id })
                        .await?
                        > 0;
                    if still_has_versions {
                        continue;
                    }
                    self.db.collection::<bson::Document>("models").delete_one(doc! { "_id": id }).await?;
                    cleaned += 1;
                }
                RecordType::Environment => {
                    if self.environment_still_referenced(id).await? {
                        continue;
                    }
                    self.db
                        .collection::<bson::Document>("environments_v2")
                        .delete_one(doc! { "_id": id })
                        .await?;
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }

    /// A revision may only be removed if no non-archived model's version
    /// still references it as its build environment.
    async fn revision_still_referenced(&self, revision_id: &str) -> Result<bool, OrchestratorError> {
        let pipeline = vec![
            doc! { "$match": { "environmentRevisionId": revision_id } },
            doc! { "$lookup": {
                "from": "models",
                "localField": "modelId.value",
                "foreignField": "_id",
                "as": "model",
            }},
            doc! { "$unwind": "$model" },
            doc! { "$match": { "model.isArchived": { "$ne": true } } },
            doc! { "$limit": 1 },
        ];
        let coll = self.db.collection::<bson::Document>("model_versions");
        let mut cursor = coll.aggregate(pipeline).await?;
        Ok(cursor.try_next().await?.is_some())
    }

    /// An environment may only be removed if no revision still references
    /// it and no non-archived model references it.
    async fn environment_still_referenced(&self, environment_id: &str) -> Result<bool, OrchestratorError> {
        let remaining_revisions = self
            .db
            .collection::<RevisionRecord>("environment_revisions")
            .count_documents(doc! { "environmentId": environment_id })
            .await?;
        if remaining_revisions > 0 {
            return Ok(true);
        }
        // A model references an environment only indirectly, through a
        // version's build revision, so this is a join rather than a direct
        // field match.
        let pipeline = vec![
            doc! { "$match": { "environmentId": environment_id } },
            doc! { "$lookup": {
                "from": "model_versions",
                "let": { "revision_id": "$_id" },
                "pipeline": [{ "$match": { "$expr": { "$eq": ["$environmentRevisionId", "$$revision_id"] } } }],
                "as": "versions",
            }},
            doc! { "$match": { "versions": { "$ne": [] } } },
            doc! { "$lookup": {
                "from": "models",
                "localField": "versions.modelId.value",
                "foreignField": "_id",
                "as": "models",
            }},
            doc! { "$match": { "models.isArchived": { "$ne": true } } },
            doc! { "$limit": 1 },
        ];
        let coll = self.db.collection::<bson::Document>("environment_revisions");
        let mut cursor = coll.aggregate(pipeline).await?;
        Ok(cursor.try_next().await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_image_merges_distinct_ids_for_same_tag() {
        let candidates = vec![
            Candidate {
                object_id: "env1".into(),
                image_type: ImageType::Environment,
                tag: "t1".into(),
                full_image: "t1".into(),
                record_type: RecordType::Environment,
            },
            Candidate {
                object_id: "rev1".into(),
                image_type: ImageType::Environment,
                tag: "t1".into(),
                full_image: "t1".into(),
                record_type: RecordType::Revision,
            },
        ];
        let items = DeletionOrchestrator::group_by_image(candidates);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object_ids.len(), 2);
    }

    #[test]
    fn deletion_item_key_scopes_by_image_type() {
        let item = DeletionItem {
            image_type: ImageType::Model,
            tag: "abc".into(),
            object_ids: vec![],
        };
        assert_eq!(item.key(), "model:abc");
    }
}
