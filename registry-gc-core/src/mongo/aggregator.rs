use bson::{doc, Document};
use chrono::{DateTime, Utc};
use futures_util::stream::TryStreamExt;
use mongodb::Database;
use serde::Deserialize;
use tracing::{debug, info};

use crate::mongo::errors::MongoUsageError;
use crate::mongo::models::{ConfigUsage, ModelUsage, RunUsage, UsageFact, WorkspaceUsage, WorkspaceUsageType};

/// Runs the seven aggregation pipelines, one per usage source,
/// each normalized to a `UsageFact` so downstream code is collection
/// agnostic. Every pipeline is read-only — running them repeatedly is
/// idempotent modulo concurrent MongoDB writes.
pub struct MongoUsageAggregator {
    db: Database,
}

#[derive(Debug, Deserialize)]
struct ModelsPipelineRow {
    environment_docker_tag: String,
    model_id: String,
    model_name: String,
    version_id: String,
}

#[derive(Debug, Deserialize)]
struct WorkspacePipelineRow {
    environment_docker_tag: String,
    workspace_id: String,
    workspace_name: String,
    project_name: String,
    usage_type: String,
    workspace_last_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RunsPipelineRow {
    environment_docker_tag: String,
    run_id: String,
    project_id: String,
    project_name: String,
    project_owner_id: String,
    project_owner_name: String,
    status: String,
    started: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ConfigPipelineRow {
    environment_docker_tag: String,
    reference_id: String,
    reference_name: String,
}

impl MongoUsageAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn run_pipeline<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<T>, MongoUsageError> {
        let coll = self.db.collection::<Document>(collection);
        let mut cursor = coll.aggregate(pipeline).await?;
        let mut rows = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let row: T = bson::from_document(doc).map_err(|e| MongoUsageError::Deserialize(e.to_string()))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// For each non-archived model, join to versions then to orchestration
    /// sagas, keeping only the latest terminal saga per version.
    pub async fn run_models_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let pipeline = vec![
            doc! { "$match": { "isArchived": { "$ne": true } } },
            doc! { "$lookup": {
                "from": "model_versions",
                "localField": "_id",
                "foreignField": "modelId.value",
                "as": "versions",
            }},
            doc! { "$unwind": "$versions" },
            doc! { "$lookup": {
                "from": "sagas",
                "let": { "version_id": "$versions._id" },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$resourceId", "$$version_id"] }, "status": { "$in": ["COMPLETED", "FAILED"] } } },
                    { "$sort": { "updatedAt": -1 } },
                    { "$limit": 1 },
                ],
                "as": "latest_saga",
            }},
            doc! { "$match": { "latest_saga": { "$ne": [] } } },
            doc! { "$project": {
                "environment_docker_tag": "$versions.metadata.builds.slug.image.tag",
                "model_id": { "$toString": "$_id" },
                "model_name": "$name",
                "version_id": { "$toString": "$versions._id" },
            }},
        ];
        let rows: Vec<ModelsPipelineRow> = self.run_pipeline("models", pipeline).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                UsageFact::Model(ModelUsage {
                    environment_docker_tag: r.environment_docker_tag,
                    model_id: r.model_id,
                    model_name: r.model_name,
                    version_id: r.version_id,
                })
            })
            .collect())
    }

    /// For each stopped/deleted workspace, look up project, owner, and
    /// configured environment; emit all tag fields.
    pub async fn run_workspace_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let pipeline = vec![
            doc! { "$match": { "status": { "$in": ["Stopped", "Deleted"] } } },
            doc! { "$lookup": {
                "from": "projects",
                "localField": "projectId",
                "foreignField": "_id",
                "as": "project",
            }},
            doc! { "$unwind": "$project" },
            doc! { "$project": {
                "environment_docker_tag": "$environmentRevisionDockerTag",
                "workspace_id": { "$toString": "$_id" },
                "workspace_name": "$name",
                "project_name": "$project.name",
                "usage_type": "$usageType",
                "workspace_last_change": "$lastChangeTime",
            }},
        ];
        let rows: Vec<WorkspacePipelineRow> = self.run_pipeline("workspace", pipeline).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let usage_type = match r.usage_type.as_str() {
                    "project_default" => WorkspaceUsageType::ProjectDefault,
                    "compute_cluster" => WorkspaceUsageType::ComputeCluster,
                    "session" => WorkspaceUsageType::Session,
                    "session_compute" => WorkspaceUsageType::SessionCompute,
                    _ => WorkspaceUsageType::Environment,
                };
                UsageFact::Workspace(WorkspaceUsage {
                    environment_docker_tag: r.environment_docker_tag,
                    workspace_id: r.workspace_id,
                    workspace_name: r.workspace_name,
                    project_name: r.project_name,
                    usage_type,
                    workspace_last_change: r.workspace_last_change,
                })
            })
            .collect())
    }

    /// For each execution record, resolve the concrete environment
    /// revision used: an explicit revision, the active revision at run
    /// time, or a parsed `SomeRevision(id)` spec.
    pub async fn run_runs_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let pipeline = vec![
            doc! { "$lookup": {
                "from": "projects",
                "localField": "projectId",
                "foreignField": "_id",
                "as": "project",
            }},
            doc! { "$unwind": "$project" },
            doc! { "$lookup": {
                "from": "users",
                "localField": "project.ownerId",
                "foreignField": "_id",
                "as": "owner",
            }},
            doc! { "$unwind": { "path": "$owner", "preserveNullAndEmptyArrays": true } },
            doc! { "$project": {
                "environment_docker_tag": { "$ifNull": ["$resolvedEnvironmentRevisionDockerTag", "$environmentRevisionDockerTag"] },
                "run_id": { "$toString": "$_id" },
                "project_id": { "$toString": "$project._id" },
                "project_name": "$project.name",
                "project_owner_id": { "$toString": "$project.ownerId" },
                "project_owner_name": { "$ifNull": ["$owner.name", ""] },
                "status": "$status",
                "started": "$startTime",
                "completed": "$completedTime",
                "last_used": "$lastUsedTime",
            }},
        ];
        let rows: Vec<RunsPipelineRow> = self.run_pipeline("runs", pipeline).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                UsageFact::Run(RunUsage {
                    environment_docker_tag: r.environment_docker_tag,
                    run_id: r.run_id,
                    project_id: r.project_id,
                    project_name: r.project_name,
                    project_owner_id: r.project_owner_id,
                    project_owner_name: r.project_owner_name,
                    status: r.status,
                    started: r.started,
                    completed: r.completed,
                    last_used: r.last_used,
                })
            })
            .collect())
    }

    /// Shared shape for the four remaining configuration sources: resolve
    /// the referenced environment to its active (or explicit) revision,
    /// then to that revision's image tag.
    async fn run_config_pipeline(&self, collection: &str, reference_field: &str) -> Result<Vec<ConfigPipelineRow>, MongoUsageError> {
        let pipeline = vec![
            doc! { "$lookup": {
                "from": "environment_revisions",
                "let": { "env_id": format!("${reference_field}") },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$environmentId", "$$env_id"] } } },
                    { "$sort": { "number": -1 } },
                    { "$limit": 1 },
                ],
                "as": "active_revision",
            }},
            doc! { "$unwind": "$active_revision" },
            doc! { "$project": {
                "environment_docker_tag": "$active_revision.metadata.dockerImageName.tag",
                "reference_id": { "$toString": "$_id" },
                "reference_name": { "$ifNull": ["$name", ""] },
            }},
        ];
        self.run_pipeline(collection, pipeline).await
    }

    pub async fn run_projects_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let rows = self.run_config_pipeline("projects", "defaultEnvironmentId").await?;
        Ok(rows.into_iter().map(|r| UsageFact::Project(row_to_config(r))).collect())
    }

    pub async fn run_scheduler_jobs_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let rows = self.run_config_pipeline("scheduler_jobs", "environmentId").await?;
        Ok(rows.into_iter().map(|r| UsageFact::SchedulerJob(row_to_config(r))).collect())
    }

    pub async fn run_organizations_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let rows = self.run_config_pipeline("organizations", "defaultEnvironmentId").await?;
        Ok(rows.into_iter().map(|r| UsageFact::Organization(row_to_config(r))).collect())
    }

    pub async fn run_app_versions_pipeline(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let rows = self.run_config_pipeline("app_versions", "environmentId").await?;
        Ok(rows.into_iter().map(|r| UsageFact::AppVersion(row_to_config(r))).collect())
    }

    /// Runs all seven pipelines concurrently and returns the combined fact
    /// list. Individual pipeline failures are not partially swallowed: a
    /// schema error is fatal, a transport error bubbles for the
    /// caller to retry.
    pub async fn aggregate_all(&self) -> Result<Vec<UsageFact>, MongoUsageError> {
        let (models, workspace, runs, projects, scheduler_jobs, organizations, app_versions) = tokio::try_join!(
            self.run_models_pipeline(),
            self.run_workspace_pipeline(),
            self.run_runs_pipeline(),
            self.run_projects_pipeline(),
            self.run_scheduler_jobs_pipeline(),
            self.run_organizations_pipeline(),
            self.run_app_versions_pipeline(),
        )?;

        let mut all = Vec::new();
        all.extend(models);
        all.extend(workspace);
        all.extend(runs);
        all.extend(projects);
        all.extend(scheduler_jobs);
        all.extend(organizations);
        all.extend(app_versions);
        info!(count = all.len(), "aggregated usage facts across all seven sources");
        debug!("usage aggregation complete");
        Ok(all)
    }
}

fn row_to_config(r: ConfigPipelineRow) -> ConfigUsage {
    ConfigUsage {
        environment_docker_tag: r.environment_docker_tag,
        reference_id: r.reference_id,
        reference_name: r.reference_name,
    }
}
