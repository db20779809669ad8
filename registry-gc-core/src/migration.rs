use std::collections::HashSet;
use std::sync::Arc;

use bson::doc;
use futures_util::stream::TryStreamExt;
use mongodb::Database;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::mongo::errors::MongoUsageError;
use crate::mongo::models::{RevisionRecord, VersionRecord};
use crate::registry::{DestinationTarget, RegistryError, RegistryOperations};

const MIGRATION_OPERATION_KIND: &str = "migration";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Mongo(#[from] MongoUsageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFilter {
    Unarchived,
    Archived,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryCopyOutcome {
    pub repository: String,
    pub copied: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Discovers, filters, and copies tags across two registries, rewriting
/// MongoDB image-repository prefixes afterward. Reuses the registry client
/// twice, once for the source's credentials and once via `DestinationTarget`
/// for the destination's, rather than hand-threading credentials through
/// call sites.
pub struct MigrationEngine {
    registry: Arc<dyn RegistryOperations>,
    db: Database,
    checkpoints: CheckpointStore,
}

#[derive(Debug, Deserialize)]
struct EnvironmentIdRow {
    #[serde(rename = "_id")]
    id: String,
}

impl MigrationEngine {
    pub fn new(registry: Arc<dyn RegistryOperations>, db: Database, checkpoints: CheckpointStore) -> Self {
        Self { registry, db, checkpoints }
    }

    /// Lists tags under the base repository and the two conventional
    /// sub-repositories, or an explicit `--repos` override.
    pub async fn discover(&self, base_repository: &str, explicit_repos: Option<&[String]>) -> Result<Vec<(String, Vec<String>)>, MigrationError> {
        let repos: Vec<String> = match explicit_repos {
            Some(repos) => repos.to_vec(),
            None => vec![
                base_repository.to_string(),
                format!("{base_repository}/environment"),
                format!("{base_repository}/model"),
            ],
        };
        let mut discovered = Vec::new();
        for repo in repos {
            let tags = self.registry.list_tags(&repo).await?;
            discovered.push((repo, tags));
        }
        Ok(discovered)
    }

    /// Builds the allowed-tag set for `--unarchived`/`--archived` filtering
    /// by querying environments/revisions and models/versions, then
    /// intersects it with what `discover` returned per repo.
    pub async fn allowed_tags(&self, filter: ArchiveFilter) -> Result<HashSet<String>, MigrationError> {
        let want_archived = matches!(filter, ArchiveFilter::Archived);

        let environments = self
            .db
            .collection::<EnvironmentIdRow>("environments_v2")
            .find(doc! { "isArchived": want_archived })
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        let env_ids: Vec<String> = environments.into_iter().map(|e| e.id).collect();

        let mut allowed = HashSet::new();
        if !env_ids.is_empty() {
            // `metadata.dockerImageName.tag`, the same path aggregator.rs's
            // config pipelines read.
            let revisions = self
                .db
                .collection::<RevisionRecord>("environment_revisions")
                .find(doc! { "environmentId": { "$in": &env_ids } })
                .await?
                .try_collect::<Vec<_>>()
                .await?;
            allowed.extend(revisions.iter().map(|r| r.docker_image_tag().to_string()));
        }

        let models = self
            .db
            .collection::<EnvironmentIdRow>("models")
            .find(doc! { "isArchived": want_archived })
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        let model_ids: Vec<String> = models.into_iter().map(|m| m.id).collect();

        if !model_ids.is_empty() {
            // `modelId` is nested as `{value}`; every build's
            // `metadata.builds[].slug.image.tag` counts as an allowed tag,
            // not just the most recent one, since older builds may still
            // be referenced by the registry.
            let versions = self
                .db
                .collection::<VersionRecord>("model_versions")
                .find(doc! { "modelId.value": { "$in": &model_ids } })
                .await?
                .try_collect::<Vec<_>>()
                .await?;
            allowed.extend(
                versions
                    .iter()
                    .flat_map(|v| v.metadata.builds.iter().map(|b| b.slug.image.tag.clone())),
            );
        }

        Ok(allowed)
    }

    /// Copies every `(repo, tag)` pair from source to destination,
    /// sequentially within a repository, checkpointed per repository so a
    /// resumed run skips repositories already in `completed_items`.
    pub async fn copy_repositories(
        &self,
        operation_id: &str,
        repos_and_tags: &[(String, Vec<String>)],
        dest: &dyn DestinationTarget,
        resume: bool,
    ) -> Result<Vec<RepositoryCopyOutcome>, MigrationError> {
        let mut checkpoint = if resume {
            self.checkpoints.load(MIGRATION_OPERATION_KIND, operation_id).await.unwrap_or_default()
        } else {
            Checkpoint::new(repos_and_tags.len())
        };

        let mut outcomes = Vec::new();
        for (repo, tags) in repos_and_tags {
            if checkpoint.completed_items.contains(repo) {
                info!(repository = repo, "skipping already-migrated repository on resume");
                continue;
            }

            let mut copied = Vec::new();
            let mut failed = Vec::new();
            for tag in tags {
                match self.registry.copy(repo, tag, repo, tag, dest).await {
                    Ok(()) => copied.push(tag.clone()),
                    Err(e) => {
                        warn!(repository = repo, tag, error = %e, "migration copy failed");
                        failed.push((tag.clone(), e.to_string()));
                    }
                }
            }

            if failed.is_empty() {
                checkpoint.mark_completed(repo.clone());
            } else {
                checkpoint.mark_failed(repo.clone(), format!("{} tag(s) failed", failed.len()));
            }
            self.checkpoints.save(MIGRATION_OPERATION_KIND, operation_id, &checkpoint).await.ok();

            outcomes.push(RepositoryCopyOutcome {
                repository: repo.clone(),
                copied,
                failed,
            });
        }

        Ok(outcomes)
    }

    /// Rewrites `old_prefix… → new_prefix/old_prefix…` on the three
    /// repository fields the migration touches, only where the value does not
    /// already carry the new prefix. Idempotent: re-running finds nothing
    /// left to rewrite.
    pub async fn rewrite_repository_prefixes(&self, old_prefix: &str, new_prefix: &str) -> Result<usize, MigrationError> {
        let mut rewritten = 0;
        rewritten += self.rewrite_field("builds", "image.repository", old_prefix, new_prefix).await?;
        rewritten += self
            .rewrite_field("environment_revisions", "metadata.dockerImageName.repository", old_prefix, new_prefix)
            .await?;
        rewritten += self.rewrite_model_version_slug_repositories(old_prefix, new_prefix).await?;
        Ok(rewritten)
    }

    async fn rewrite_field(&self, collection: &str, field_path: &str, old_prefix: &str, new_prefix: &str) -> Result<usize, MigrationError> {
        let coll = self.db.collection::<bson::Document>(collection);
        let mut needs_rewrite = bson::Document::new();
        needs_rewrite.insert(field_path, doc! { "$regex": format!("^{}", regex::escape(old_prefix)) });
        let mut cursor = coll.find(needs_rewrite).await?;
        let mut ids = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(id) = doc.get_object_id("_id") {
                ids.push(id);
            }
        }
        let mut count = 0;
        for id in ids {
            let existing = coll.find_one(doc! { "_id": id }).await?;
            let Some(existing) = existing else { continue };
            let Some(value) = get_nested_str(&existing, field_path) else { continue };
            if value.starts_with(&format!("{new_prefix}/{old_prefix}")) {
                continue;
            }
            let rewritten = format!("{new_prefix}/{value}");
            let mut set_doc = bson::Document::new();
            set_doc.insert(field_path, rewritten);
            coll.update_one(doc! { "_id": id }, doc! { "$set": set_doc }).await?;
            count += 1;
        }
        Ok(count)
    }

    /// `model_versions.metadata.builds[].slug.image.repository` is an array
    /// of subdocuments, so it needs element-wise rewriting rather than the
    /// single-field `$set` used by `rewrite_field`.
    async fn rewrite_model_version_slug_repositories(&self, old_prefix: &str, new_prefix: &str) -> Result<usize, MigrationError> {
        let coll = self.db.collection::<bson::Document>("model_versions");
        let mut cursor = coll.find(doc! {}).await?;
        let mut count = 0;
        while let Some(mut doc) = cursor.try_next().await? {
            let Some(id) = doc.get_object_id("_id").ok() else { continue };
            let Some(metadata) = doc.get_document_mut("metadata").ok() else { continue };
            let Some(builds) = metadata.get_array_mut("builds").ok() else { continue };
            let mut changed = false;
            for build in builds.iter_mut() {
                let Some(build_doc) = build.as_document_mut() else { continue };
                let Some(slug) = build_doc.get_document_mut("slug").ok() else { continue };
                let Some(image) = slug.get_document_mut("image").ok() else { continue };
                let Some(repository) = image.get_str("repository").ok().map(|s| s.to_string()) else { continue };
                if repository.starts_with(old_prefix) && !repository.starts_with(&format!("{new_prefix}/{old_prefix}")) {
                    image.insert("repository", format!("{new_prefix}/{repository}"));
                    changed = true;
                }
            }
            if changed {
                coll.update_one(doc! { "_id": id }, doc! { "$set": { "metadata": metadata.clone() } }).await?;
                count += 1;
            }
        }
        Ok(count)
    }
}

fn get_nested_str(doc: &bson::Document, dotted_path: &str) -> Option<String> {
    let mut current = doc;
    let parts: Vec<&str> = dotted_path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            return current.get_str(part).ok().map(|s| s.to_string());
        }
        current = current.get_document(part).ok()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_nested_str_reads_dotted_path() {
        let doc = doc! { "metadata": { "dockerImageName": { "repository": "old/base" } } };
        let value = get_nested_str(&doc, "metadata.dockerImageName.repository");
        assert_eq!(value, Some("old/base".to_string()));
    }

    #[test]
    fn get_nested_str_returns_none_for_missing_path() {
        let doc = doc! { "metadata": {} };
        assert_eq!(get_nested_str(&doc, "metadata.dockerImageName.repository"), None);
    }
}
