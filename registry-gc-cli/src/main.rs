use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use registry_gc_core::backup::BackupAdapter;
use registry_gc_core::candidates::{CandidateSelector, StaticDeactivatedUserSource};
use registry_gc_core::checkpoint::CheckpointStore;
use registry_gc_core::cluster::RegistryDeleteModeToggle;
use registry_gc_core::layer_graph::{ImageType, LayerGraph};
use registry_gc_core::migration::{ArchiveFilter, MigrationEngine};
use registry_gc_core::mongo::{connect, MongoUsageAggregator, SnapshotStore};
use registry_gc_core::orchestrator::{DeletionOrchestrator, DeletionRequest};
use registry_gc_core::registry::credentials::{CredentialSource, RegistryCredentials};
use registry_gc_core::registry::{cache::RegistryCaches, RegistryClient};
use registry_gc_core::report::{CandidateReport, DeletionReport, MigrationReport, MigrationReportEntry, MigrationSummary, ReportMetadata, ReportWriter};
use registry_gc_core::settings::Settings;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resolves credentials the way the core's credential priority order
/// expects: an explicit environment variable pair first, a named
/// secret-store reference second. The secret-store fetch itself is an
/// external collaborator, so this adapter only implements the environment
/// tier and falls back to anonymous when no secret is configured — enough
/// to exercise the same `CredentialSource` boundary the core depends on.
struct CliCredentialSource {
    secret_ref: Option<String>,
}

#[async_trait::async_trait]
impl CredentialSource for CliCredentialSource {
    async fn resolve(&self) -> anyhow::Result<RegistryCredentials> {
        if let (Ok(user), Ok(pass)) = (std::env::var("REGISTRY_GC_REGISTRY_USERNAME"), std::env::var("REGISTRY_GC_REGISTRY_PASSWORD")) {
            return Ok(RegistryCredentials {
                username: user,
                password: pass,
                bearer_token: None,
            });
        }
        if let Ok(token) = std::env::var("REGISTRY_GC_REGISTRY_TOKEN") {
            return Ok(RegistryCredentials {
                username: String::new(),
                password: String::new(),
                bearer_token: Some(token),
            });
        }
        if self.secret_ref.is_some() {
            warn!("auth_secret_ref configured but no secret-store adapter is wired in; falling back to anonymous");
        }
        Ok(RegistryCredentials::anonymous())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Garbage collection and migration toolkit for a Docker registry backed by a MongoDB control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a deletion scenario and write a report, without deleting anything
    Analyze {
        #[command(subcommand)]
        scenario: GcScenario,
    },
    /// Apply a deletion scenario: analyze, then (unless --dry-run) delete
    Apply {
        #[command(subcommand)]
        scenario: GcScenario,
        /// Back up each surviving tag to object storage before deleting
        #[arg(long)]
        backup: bool,
        /// Only treat historical usage (runs, workspaces) older than this as unused
        #[arg(long)]
        recency_days: Option<i64>,
        /// Flip the in-cluster registry's delete-mode env var around the run
        #[arg(long)]
        cluster_delete_mode: bool,
        /// Delete Mongo records for IDs whose every tag was deleted
        #[arg(long)]
        mongo_cleanup: bool,
        /// Resume a previous run by operation ID, skipping completed items
        #[arg(long)]
        resume: Option<String>,
        /// Produce the same analysis and report without deleting, backing up, or patching anything
        #[arg(long)]
        dry_run: bool,
        /// Override security.dry_run_by_default and actually perform deletions
        #[arg(long)]
        execute: bool,
    },
    /// Copy images from one registry to another and optionally rewrite Mongo repository prefixes
    Migrate {
        /// Destination registry base URL
        #[arg(long)]
        dest_url: String,
        /// Destination basic-auth username (mutually exclusive with --dest-token)
        #[arg(long)]
        dest_username: Option<String>,
        #[arg(long)]
        dest_password: Option<String>,
        /// Destination bearer token (mutually exclusive with --dest-username)
        #[arg(long)]
        dest_token: Option<String>,
        #[arg(long, default_value_t = true)]
        dest_tls_verify: bool,
        /// Explicit repository list, overriding the base + environment/model convention
        #[arg(long)]
        repos: Vec<String>,
        #[arg(long)]
        unarchived: bool,
        #[arg(long)]
        archived: bool,
        /// Resume a previous migration by operation ID
        #[arg(long)]
        resume: Option<String>,
        /// Rewrite Mongo repository-prefix fields after copying
        #[arg(long)]
        rewrite_prefix: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum GcScenario {
    /// Archived environments/models, expanded to revisions/versions
    Archived,
    /// Non-archived environments touched by no usage source at all
    Unused,
    /// Private environments owned by deactivated users
    DeactivatedOwners {
        /// Deactivated user IDs (normally sourced from Keycloak; passed explicitly here since
        /// user enumeration is an external collaborator)
        #[arg(long = "user-id")]
        user_ids: Vec<String>,
    },
    /// MongoDB references whose tag is absent from the registry's tag universe
    Orphans,
}

fn gc_report_filename(settings: &Settings, scenario: &GcScenario) -> String {
    match scenario {
        GcScenario::Archived => settings.reports.archived_filename.clone(),
        GcScenario::Unused => settings.reports.unused_filename.clone(),
        GcScenario::DeactivatedOwners { .. } => settings.reports.deactivated_filename.clone(),
        GcScenario::Orphans => settings.reports.orphan_filename.clone(),
    }
}

async fn build_registry_client(settings: &Settings) -> Result<Arc<RegistryClient>> {
    let credentials: Arc<dyn CredentialSource> = Arc::new(CliCredentialSource {
        secret_ref: settings.registry.auth_secret_ref.clone(),
    });
    let client = RegistryClient::new(
        reqwest::Url::parse(&settings.registry.url).context("invalid registry URL")?,
        credentials,
        &settings.rate_limit,
        settings.retry.clone(),
        RegistryCaches::new(&settings.cache),
        settings.registry.tls_verify.unwrap_or(true),
    )?;
    Ok(Arc::new(client))
}

/// Resolves the registry tags for both image types: cross-type layer
/// sharing means freed space must always be computed with both types in
/// scope, even when only one is the deletion target.
async fn tags_by_type(registry: &Arc<RegistryClient>, repository_base: &str) -> Result<HashMap<ImageType, Vec<String>>> {
    let mut by_type = HashMap::new();
    for image_type in [ImageType::Environment, ImageType::Model] {
        let repo = format!("{repository_base}/{}", image_type.repository_segment());
        let tags = registry_gc_core::registry::RegistryOperations::list_tags(registry.as_ref(), &repo).await?;
        by_type.insert(image_type, tags);
    }
    Ok(by_type)
}

async fn select_candidates(
    scenario: &GcScenario,
    selector: &CandidateSelector<'_>,
    registry_tags_by_type: &HashMap<ImageType, Vec<String>>,
    usage_facts: &[registry_gc_core::mongo::models::UsageFact],
) -> Result<Vec<registry_gc_core::candidates::Candidate>> {
    let candidates = match scenario {
        GcScenario::Archived => selector.archived_candidates(registry_tags_by_type).await?,
        GcScenario::Unused => {
            let env_tags = registry_tags_by_type.get(&ImageType::Environment).cloned().unwrap_or_default();
            let used_ids = selector.used_environment_ids(usage_facts).await?;
            selector.unused_candidates(&used_ids, &env_tags).await?
        }
        GcScenario::DeactivatedOwners { user_ids } => {
            let source = StaticDeactivatedUserSource {
                ids: user_ids.iter().cloned().collect(),
            };
            let deactivated = registry_gc_core::candidates::DeactivatedUserSource::deactivated_user_ids(&source).await?;
            let env_tags = registry_tags_by_type.get(&ImageType::Environment).cloned().unwrap_or_default();
            selector.deactivated_owner_candidates(&deactivated, &env_tags).await?
        }
        GcScenario::Orphans => {
            let mut tags_as_sets = HashMap::new();
            for (image_type, tags) in registry_tags_by_type {
                tags_as_sets.insert(*image_type, tags.iter().cloned().collect());
            }
            selector.orphan_candidates(&tags_as_sets).await?
        }
    };
    Ok(candidates)
}

fn image_keys_for(candidates: &[registry_gc_core::candidates::Candidate]) -> Vec<registry_gc_core::layer_graph::ImageKey> {
    candidates
        .iter()
        .map(|c| registry_gc_core::layer_graph::ImageKey {
            image_type: c.image_type,
            tag: c.tag.clone(),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::new().context("loading configuration")?;
    let registry = build_registry_client(&settings).await?;
    let db = connect(&settings.mongo).await?;
    let report_writer = ReportWriter::new(&settings.analysis.output_dir);

    match &cli.command {
        Commands::Analyze { scenario } => {
            let registry_tags = tags_by_type(&registry, &settings.registry.repository_base).await?;
            let selector = CandidateSelector::new(&db);
            let aggregator = MongoUsageAggregator::new(db.clone());
            let snapshot_path = PathBuf::from(&settings.analysis.output_dir).join("usage-snapshot.json");
            let snapshot_store = SnapshotStore::new(snapshot_path);
            let snapshot = snapshot_store
                .ensure_fresh(&aggregator, chrono::Duration::hours(settings.analysis.snapshot_max_age_hours as i64))
                .await?;
            let candidates = select_candidates(scenario, &selector, &registry_tags, &snapshot.facts).await?;

            let graph = LayerGraph::build(registry.clone(), &settings.registry.repository_base, &[ImageType::Environment, ImageType::Model], settings.analysis.max_workers, None).await?;
            let freed_bytes = graph.freed_space_if_deleted(&image_keys_for(&candidates));

            let report = CandidateReport::new(
                candidates,
                freed_bytes,
                ReportMetadata {
                    registry_url: settings.registry.url.clone(),
                    repository: settings.registry.repository_base.clone(),
                    generated_at: Utc::now(),
                },
            );
            info!(
                total = report.summary.total_candidates,
                freed_gb = report.summary.estimated_freed_gb,
                "analysis complete"
            );
            let path = report_writer.write(&gc_report_filename(&settings, scenario), &report).await?;
            println!("wrote report to {}", path.display());
        }
        Commands::Apply {
            scenario,
            backup,
            recency_days,
            cluster_delete_mode,
            mongo_cleanup,
            resume,
            dry_run,
            execute,
        } => {
            let registry_tags = tags_by_type(&registry, &settings.registry.repository_base).await?;
            let selector = CandidateSelector::new(&db);

            let aggregator = MongoUsageAggregator::new(db.clone());
            let snapshot_path = PathBuf::from(&settings.analysis.output_dir).join("usage-snapshot.json");
            let snapshot_store = SnapshotStore::new(snapshot_path);
            let snapshot = snapshot_store
                .ensure_fresh(&aggregator, chrono::Duration::hours(settings.analysis.snapshot_max_age_hours as i64))
                .await?;
            let candidates = select_candidates(scenario, &selector, &registry_tags, &snapshot.facts).await?;

            // Dry-run unless the operator overrides the configured default with an
            // explicit flag; --dry-run and --execute are mutually exclusive overrides.
            let effective_dry_run = if *dry_run {
                true
            } else if *execute {
                false
            } else {
                settings.security.dry_run_by_default
            };
            if effective_dry_run {
                info!("dry-run: analysis only, no deletions, backups, or cluster patches will be performed");
                let report = CandidateReport::new(
                    candidates,
                    0,
                    ReportMetadata {
                        registry_url: settings.registry.url.clone(),
                        repository: settings.registry.repository_base.clone(),
                        generated_at: Utc::now(),
                    },
                );
                let path = report_writer.write(&gc_report_filename(&settings, scenario), &report).await?;
                println!("dry-run report written to {}", path.display());
                return Ok(());
            }

            let checkpoints = CheckpointStore::new(&settings.analysis.output_dir);
            let cluster_toggle = if *cluster_delete_mode && !settings.cluster.namespace.is_empty() {
                match kube::Client::try_default().await {
                    Ok(client) => Some(RegistryDeleteModeToggle::new(
                        client,
                        settings.cluster.namespace.clone(),
                        settings.cluster.registry_workload_name.clone(),
                        Duration::from_secs(settings.cluster.pod_ready_timeout_secs),
                    )),
                    Err(e) => {
                        warn!(error = %e, "could not build Kubernetes client, proceeding without delete-mode toggle");
                        None
                    }
                }
            } else {
                None
            };

            let backup_adapter = if *backup {
                let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let s3_client = aws_sdk_s3::Client::new(&aws_config);
                let destination = Arc::new(registry_gc_core::backup::S3BackupDestination::new(s3_client, settings.backup.bucket.clone()));
                Some(Arc::new(BackupAdapter::new(registry.clone(), destination)))
            } else {
                None
            };

            let orchestrator = DeletionOrchestrator::new(registry.clone(), db.clone(), checkpoints, cluster_toggle, backup_adapter);
            let operation_id = resume.clone().unwrap_or_else(|| Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
            let request = DeletionRequest {
                candidates,
                repository_base: settings.registry.repository_base.clone(),
                backup: *backup,
                recency_days: *recency_days,
                cluster_delete_mode: *cluster_delete_mode,
                resume: resume.is_some(),
                operation_id: operation_id.clone(),
                mongo_cleanup: *mongo_cleanup,
                max_workers: settings.analysis.max_workers,
            };
            let result = orchestrator.apply(request, &snapshot.facts).await?;

            println!(
                "backed up {}, deleted {}, mongo cleaned {}, skipped-in-use {}, failed {} (operation {operation_id})",
                result.images_backed_up,
                result.docker_images_deleted,
                result.mongo_records_cleaned,
                result.skipped_in_use.len(),
                result.failed.len(),
            );
            for skipped in &result.skipped_in_use {
                println!("  skipped {}: {}", skipped.tag, skipped.usage_summary);
            }
            for failed in &result.failed {
                println!("  failed {}: {}", failed.tag, failed.reason);
            }

            let report = DeletionReport {
                summary: result.clone(),
                metadata: ReportMetadata {
                    registry_url: settings.registry.url.clone(),
                    repository: settings.registry.repository_base.clone(),
                    generated_at: Utc::now(),
                },
            };
            report_writer.write(&gc_report_filename(&settings, scenario), &report).await?;

            if !result.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Migrate {
            dest_url,
            dest_username,
            dest_password,
            dest_token,
            dest_tls_verify,
            repos,
            unarchived,
            archived,
            resume,
            rewrite_prefix,
        } => {
            let checkpoints = CheckpointStore::new(&settings.analysis.output_dir);
            let engine = MigrationEngine::new(registry.clone(), db.clone(), checkpoints);

            let explicit_repos = if repos.is_empty() { None } else { Some(repos.as_slice()) };
            let discovered = engine.discover(&settings.registry.repository_base, explicit_repos).await?;

            let filtered = if *unarchived || *archived {
                let filter = if *archived { ArchiveFilter::Archived } else { ArchiveFilter::Unarchived };
                let allowed = engine.allowed_tags(filter).await?;
                discovered
                    .into_iter()
                    .map(|(repo, tags)| (repo, tags.into_iter().filter(|t| allowed.contains(t)).collect::<Vec<_>>()))
                    .collect()
            } else {
                discovered
            };

            let destination = MigrationDestination {
                url: dest_url.clone(),
                username: dest_username.clone().unwrap_or_default(),
                password: dest_password.clone().unwrap_or_default(),
                token: dest_token.clone(),
                tls_verify: *dest_tls_verify,
            };

            let operation_id = resume.clone().unwrap_or_else(|| Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
            let outcomes = engine.copy_repositories(&operation_id, &filtered, &destination, resume.is_some()).await?;

            let mut rewritten = 0;
            if let Some(prefix) = rewrite_prefix {
                rewritten = engine.rewrite_repository_prefixes(&settings.registry.repository_base, prefix).await?;
            }

            let copied: usize = outcomes.iter().map(|o| o.copied.len()).sum();
            let failed: usize = outcomes.iter().map(|o| o.failed.len()).sum();
            println!("migrated {copied} tag(s) across {} repositories, {failed} failure(s), rewrote {rewritten} Mongo record(s) (operation {operation_id})", outcomes.len());

            let report = MigrationReport {
                summary: MigrationSummary {
                    repositories: outcomes.len(),
                    copied,
                    failed,
                },
                details_by_repository: outcomes
                    .into_iter()
                    .map(|o| MigrationReportEntry {
                        repository: o.repository,
                        copied: o.copied,
                        failed: o.failed,
                    })
                    .collect(),
                metadata: ReportMetadata {
                    registry_url: settings.registry.url.clone(),
                    repository: settings.registry.repository_base.clone(),
                    generated_at: Utc::now(),
                },
            };
            report_writer.write(&settings.reports.migration_filename, &report).await?;

            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

struct MigrationDestination {
    url: String,
    username: String,
    password: String,
    token: Option<String>,
    tls_verify: bool,
}

#[async_trait::async_trait]
impl registry_gc_core::registry::DestinationTarget for MigrationDestination {
    fn registry_url(&self) -> &str {
        &self.url
    }

    fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    async fn credentials(&self) -> Result<RegistryCredentials, registry_gc_core::registry::RegistryError> {
        if let Some(token) = &self.token {
            return Ok(RegistryCredentials {
                username: String::new(),
                password: String::new(),
                bearer_token: Some(token.clone()),
            });
        }
        Ok(RegistryCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            bearer_token: None,
        })
    }
}
