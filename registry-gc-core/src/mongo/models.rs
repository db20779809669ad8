use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One usage fact normalized to `{environment_docker_tag, <context>}`,
/// regardless of which of the seven collections it came from — downstream
/// code never needs to know which pipeline produced a given fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source")]
pub enum UsageFact {
    Run(RunUsage),
    Workspace(WorkspaceUsage),
    Model(ModelUsage),
    SchedulerJob(ConfigUsage),
    Project(ConfigUsage),
    Organization(ConfigUsage),
    AppVersion(ConfigUsage),
}

impl UsageFact {
    pub fn docker_tag(&self) -> &str {
        match self {
            UsageFact::Run(r) => &r.environment_docker_tag,
            UsageFact::Workspace(w) => &w.environment_docker_tag,
            UsageFact::Model(m) => &m.environment_docker_tag,
            UsageFact::SchedulerJob(c) | UsageFact::Project(c) | UsageFact::Organization(c) | UsageFact::AppVersion(c) => {
                &c.environment_docker_tag
            }
        }
    }

    /// Whether this fact comes from a configuration source (always
    /// current, no timestamp) as opposed to a historical one.
    pub fn is_configuration_source(&self) -> bool {
        matches!(
            self,
            UsageFact::Model(_) | UsageFact::SchedulerJob(_) | UsageFact::Project(_) | UsageFact::Organization(_) | UsageFact::AppVersion(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunUsage {
    pub environment_docker_tag: String,
    pub run_id: String,
    pub project_id: String,
    pub project_name: String,
    pub project_owner_id: String,
    pub project_owner_name: String,
    pub status: String,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl RunUsage {
    /// Most recent timestamp for recency filtering: `last_used`, else
    /// `completed`, else `started`.
    pub fn recency_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_used.or(self.completed).or(self.started)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkspaceUsageType {
    Environment,
    ProjectDefault,
    ComputeCluster,
    Session,
    SessionCompute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceUsage {
    pub environment_docker_tag: String,
    pub workspace_id: String,
    pub workspace_name: String,
    pub project_name: String,
    pub usage_type: WorkspaceUsageType,
    pub workspace_last_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub environment_docker_tag: String,
    pub model_id: String,
    pub model_name: String,
    pub version_id: String,
}

/// Shape shared by the four configuration-only sources (scheduler jobs,
/// projects, organizations, app versions): no timestamps, always counted
/// as current usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUsage {
    pub environment_docker_tag: String,
    pub reference_id: String,
    pub reference_name: String,
}

/// One of the four archive-record types, with the parent→child
/// relations (`environment → revisions`, `model → versions`) and the
/// optional cloned-revision pointer the deletion orchestrator must respect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub is_archived: bool,
    pub owner_id: String,
    pub is_private: bool,
}

/// Shared shape of the `{tag, repository}` pair stored wherever a docker
/// image reference is recorded (`dockerImageName`, `slug.image`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerImageRef {
    pub tag: String,
    #[serde(default)]
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMetadata {
    pub docker_image_name: DockerImageRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub environment_id: String,
    pub metadata: RevisionMetadata,
    #[serde(default)]
    pub cloned_environment_revision_id: Option<String>,
}

impl RevisionRecord {
    /// The registry tag stored at `metadata.dockerImageName.tag` — the
    /// same path `aggregator.rs`'s config pipelines and `migration.rs`'s
    /// prefix rewrite read/write.
    pub fn docker_image_tag(&self) -> &str {
        &self.metadata.docker_image_name.tag
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub is_archived: bool,
}

/// `model_versions.modelId` is a nested `{value}` reference, not a bare
/// ObjectID string (the same shape `aggregator.rs`'s models pipeline joins
/// on via `modelId.value`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelIdRef {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlugRef {
    pub image: DockerImageRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub slug: SlugRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub builds: Vec<BuildRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub model_id: Option<ModelIdRef>,
    #[serde(default)]
    pub environment_revision_id: Option<String>,
    #[serde(default)]
    pub metadata: VersionMetadata,
}

impl VersionRecord {
    /// The slug image tag from the version's most recent build record, at
    /// `metadata.builds[].slug.image.tag` — the same array
    /// `migration.rs`'s per-build prefix rewrite walks.
    pub fn slug_image_tag(&self) -> Option<&str> {
        self.metadata.builds.last().map(|b| b.slug.image.tag.as_str())
    }

    pub fn model_id_value(&self) -> Option<&str> {
        self.model_id.as_ref().map(|m| m.value.as_str())
    }
}
