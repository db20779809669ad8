use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bson::doc;
use futures_util::stream::TryStreamExt;
use mongodb::Database;
use serde::Serialize;

use crate::layer_graph::ImageType;
use crate::mongo::errors::MongoUsageError;
use crate::mongo::models::{EnvironmentRecord, ModelRecord, RevisionRecord, UsageFact, VersionRecord};
use crate::tag_resolver::{id_matches_tag, resolve_matches, RecordType, RevisionInfo, VersionInfo};

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub object_id: String,
    pub image_type: ImageType,
    pub tag: String,
    pub full_image: String,
    pub record_type: RecordType,
}

/// External collaborator boundary for Keycloak user enumeration. The
/// core only needs the resulting set of deactivated user
/// IDs, never the enumeration mechanism itself.
#[async_trait]
pub trait DeactivatedUserSource: Send + Sync {
    async fn deactivated_user_ids(&self) -> anyhow::Result<HashSet<String>>;
}

/// A static/minimal adapter satisfying the `DeactivatedUserSource`
/// boundary without reimplementing Keycloak enumeration.
pub struct StaticDeactivatedUserSource {
    pub ids: HashSet<String>,
}

#[async_trait]
impl DeactivatedUserSource for StaticDeactivatedUserSource {
    async fn deactivated_user_ids(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self.ids.clone())
    }
}

pub struct CandidateSelector<'a> {
    db: &'a Database,
}

impl<'a> CandidateSelector<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    async fn all_environments(&self) -> Result<Vec<EnvironmentRecord>, MongoUsageError> {
        let coll = self.db.collection::<EnvironmentRecord>("environments_v2");
        let mut cursor = coll.find(doc! {}).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn revisions_for_environment(&self, environment_id: &str) -> Result<Vec<RevisionRecord>, MongoUsageError> {
        let coll = self.db.collection::<RevisionRecord>("environment_revisions");
        let mut cursor = coll.find(doc! { "environmentId": environment_id }).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn all_models(&self) -> Result<Vec<ModelRecord>, MongoUsageError> {
        let coll = self.db.collection::<ModelRecord>("models");
        let mut cursor = coll.find(doc! {}).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn versions_for_model(&self, model_id: &str) -> Result<Vec<VersionRecord>, MongoUsageError> {
        let coll = self.db.collection::<VersionRecord>("model_versions");
        let mut cursor = cursor_for_model_id(&coll, model_id).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    /// Archived environments/models, expanded to revisions/versions and
    /// intersected with the registry's current tag universe.
    pub async fn archived_candidates(&self, registry_tags_by_type: &HashMap<ImageType, Vec<String>>) -> Result<Vec<Candidate>, MongoUsageError> {
        let mut candidates = Vec::new();

        let environments = self.all_environments().await?;
        let archived_env_ids: Vec<String> = environments.iter().filter(|e| e.is_archived).map(|e| e.id.clone()).collect();
        let mut revisions_by_env: HashMap<String, Vec<RevisionInfo>> = HashMap::new();
        for env_id in &archived_env_ids {
            let revisions = self.revisions_for_environment(env_id).await?;
            revisions_by_env.insert(
                env_id.clone(),
                revisions
                    .into_iter()
                    .map(|r| {
                        let tag_suffix = r.docker_image_tag().split_once('-').map(|(_, suffix)| suffix.to_string());
                        RevisionInfo {
                            revision_id: r.id,
                            tag_suffix,
                        }
                    })
                    .collect(),
            );
        }

        let models = self.all_models().await?;
        let archived_model_ids: Vec<String> = models.iter().filter(|m| m.is_archived).map(|m| m.id.clone()).collect();
        let mut versions_by_model: HashMap<String, Vec<VersionInfo>> = HashMap::new();
        for model_id in &archived_model_ids {
            let versions = self.versions_for_model(model_id).await?;
            versions_by_model.insert(
                model_id.clone(),
                versions
                    .into_iter()
                    .filter_map(|v| {
                        let slug_tag = v.slug_image_tag()?.to_string();
                        Some(VersionInfo {
                            version_id: v.id,
                            slug_tag,
                        })
                    })
                    .collect(),
            );
        }

        if let Some(env_tags) = registry_tags_by_type.get(&ImageType::Environment) {
            for m in resolve_matches(env_tags, &archived_env_ids, &revisions_by_env, &[], &HashMap::new()) {
                candidates.push(Candidate {
                    object_id: m.object_id,
                    image_type: ImageType::Environment,
                    tag: m.tag.clone(),
                    full_image: m.tag,
                    record_type: m.record_type,
                });
            }
        }
        if let Some(model_tags) = registry_tags_by_type.get(&ImageType::Model) {
            for m in resolve_matches(model_tags, &[], &HashMap::new(), &archived_model_ids, &versions_by_model) {
                candidates.push(Candidate {
                    object_id: m.object_id,
                    image_type: ImageType::Model,
                    tag: m.tag.clone(),
                    full_image: m.tag,
                    record_type: m.record_type,
                });
            }
        }

        dedupe_by_image(candidates)
    }

    /// Environment and revision IDs touched by any usage source: the
    /// consolidated usage snapshot (runs, workspaces, models, scheduler
    /// jobs, projects, organizations, app versions — resolved back from
    /// their docker tags), direct workspace/session environment
    /// references, and any user's `defaultEnvironmentId`. Feeds
    /// `unused_candidates`, whose complement this set defines.
    pub async fn used_environment_ids(&self, usage_facts: &[UsageFact]) -> Result<HashSet<String>, MongoUsageError> {
        let mut used = HashSet::new();

        let environments = self.all_environments().await?;
        let mut all_env_ids = Vec::new();
        let mut all_revision_ids = Vec::new();
        for env in &environments {
            all_env_ids.push(env.id.clone());
            for revision in self.revisions_for_environment(&env.id).await? {
                all_revision_ids.push(revision.id.clone());
            }
        }

        for fact in usage_facts {
            let tag = fact.docker_tag();
            for revision_id in &all_revision_ids {
                if id_matches_tag(revision_id, tag) {
                    used.insert(revision_id.clone());
                }
            }
            for env_id in &all_env_ids {
                if id_matches_tag(env_id, tag) {
                    used.insert(env_id.clone());
                }
            }
        }

        for collection in ["workspace", "workspace_session"] {
            let coll = self.db.collection::<bson::Document>(collection);
            let mut cursor = coll.find(doc! {}).await?;
            while let Some(doc) = cursor.try_next().await? {
                for field in ["environmentId", "environmentRevisionId"] {
                    if let Ok(id) = doc.get_str(field) {
                        used.insert(id.to_string());
                    }
                }
            }
        }

        let prefs = self.db.collection::<bson::Document>("userPreferences");
        let mut cursor = prefs.find(doc! {}).await?;
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(id) = doc.get_str("defaultEnvironmentId") {
                used.insert(id.to_string());
            }
        }

        Ok(used)
    }

    /// Non-archived environments whose IDs are touched by no usage source
    /// at all (the complement of "used").
    pub async fn unused_candidates(
        &self,
        used_ids: &HashSet<String>,
        registry_tags: &[String],
    ) -> Result<Vec<Candidate>, MongoUsageError> {
        let environments = self.all_environments().await?;
        let mut candidates = Vec::new();
        for env in environments.iter().filter(|e| !e.is_archived) {
            let revisions = self.revisions_for_environment(&env.id).await?;
            for revision in revisions {
                if used_ids.contains(&env.id) || used_ids.contains(&revision.id) {
                    continue;
                }
                if let Some(tag) = registry_tags.iter().find(|t| id_matches_tag(&revision.id, t) || id_matches_tag(&env.id, t)) {
                    candidates.push(Candidate {
                        object_id: revision.id.clone(),
                        image_type: ImageType::Environment,
                        tag: tag.clone(),
                        full_image: tag.clone(),
                        record_type: RecordType::Revision,
                    });
                }
            }
        }
        dedupe_by_image(candidates)
    }

    /// Private environments owned by deactivated users, expanded to
    /// revisions, still subject to the orchestrator's cloned-revision closure.
    pub async fn deactivated_owner_candidates(
        &self,
        deactivated_user_ids: &HashSet<String>,
        registry_tags: &[String],
    ) -> Result<Vec<Candidate>, MongoUsageError> {
        let environments = self.all_environments().await?;
        let mut candidates = Vec::new();
        for env in environments.iter().filter(|e| e.is_private && deactivated_user_ids.contains(&e.owner_id)) {
            let revisions = self.revisions_for_environment(&env.id).await?;
            for revision in revisions {
                if let Some(tag) = registry_tags.iter().find(|t| id_matches_tag(&revision.id, t)) {
                    candidates.push(Candidate {
                        object_id: revision.id.clone(),
                        image_type: ImageType::Environment,
                        tag: tag.clone(),
                        full_image: tag.clone(),
                        record_type: RecordType::Revision,
                    });
                }
            }
        }
        dedupe_by_image(candidates)
    }

    /// Records in `environment_revisions`/`model_versions` whose stored
    /// tag is absent from the registry's current tag universe (stale
    /// MongoDB references).
    pub async fn orphan_candidates(&self, registry_tags_by_type: &HashMap<ImageType, HashSet<String>>) -> Result<Vec<Candidate>, MongoUsageError> {
        let mut candidates = Vec::new();
        let environments = self.all_environments().await?;
        let env_tags = registry_tags_by_type.get(&ImageType::Environment).cloned().unwrap_or_default();
        for env in &environments {
            for revision in self.revisions_for_environment(&env.id).await? {
                let tag = revision.docker_image_tag().to_string();
                if !env_tags.contains(&tag) {
                    candidates.push(Candidate {
                        object_id: revision.id.clone(),
                        image_type: ImageType::Environment,
                        tag: tag.clone(),
                        full_image: tag,
                        record_type: RecordType::Revision,
                    });
                }
            }
        }

        let models = self.all_models().await?;
        let model_tags = registry_tags_by_type.get(&ImageType::Model).cloned().unwrap_or_default();
        for model in &models {
            for version in self.versions_for_model(&model.id).await? {
                let Some(tag) = version.slug_image_tag().map(|t| t.to_string()) else {
                    continue;
                };
                if !model_tags.contains(&tag) {
                    candidates.push(Candidate {
                        object_id: version.id.clone(),
                        image_type: ImageType::Model,
                        tag: tag.clone(),
                        full_image: tag,
                        record_type: RecordType::Version,
                    });
                }
            }
        }
        dedupe_by_image(candidates)
    }
}

/// Deduplicates by `(image_type, tag)`, merging the archived IDs
/// associated with each unique image: a tag appears at
/// most once after dedup even if multiple archived IDs produced it. Since
/// downstream consumers key off `object_id`, the first match wins and later
/// duplicates are dropped — distinct IDs for the same tag collapse to one
/// deletion candidate.
fn dedupe_by_image(candidates: Vec<Candidate>) -> Result<Vec<Candidate>, MongoUsageError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let key = (candidate.image_type, candidate.tag.clone());
        if seen.insert(key) {
            out.push(candidate);
        }
    }
    Ok(out)
}

async fn cursor_for_model_id(
    coll: &mongodb::Collection<VersionRecord>,
    model_id: &str,
) -> Result<mongodb::Cursor<VersionRecord>, MongoUsageError> {
    Ok(coll.find(doc! { "modelId.value": model_id }).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_match_per_image() {
        let candidates = vec![
            Candidate {
                object_id: "a".into(),
                image_type: ImageType::Environment,
                tag: "t1".into(),
                full_image: "t1".into(),
                record_type: RecordType::Revision,
            },
            Candidate {
                object_id: "b".into(),
                image_type: ImageType::Environment,
                tag: "t1".into(),
                full_image: "t1".into(),
                record_type: RecordType::Revision,
            },
        ];
        let deduped = dedupe_by_image(candidates).unwrap();
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].object_id, "a");
    }
}
