use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::mongo::models::UsageFact;

const EXAMPLE_CAP: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub runs_count: usize,
    pub workspaces_count: usize,
    pub models_count: usize,
    pub scheduler_jobs: Vec<String>,
    pub projects: Vec<String>,
    pub organizations: Vec<String>,
    pub app_versions: Vec<String>,
    pub runs: Vec<UsageFact>,
    pub workspaces: Vec<UsageFact>,
    pub models: Vec<UsageFact>,
    pub usage_summary: String,
    pub in_use: bool,
}

/// Indexes a consolidated usage snapshot for point lookups by tag, plus a
/// prefix index keyed by ObjectID for the extended-tag fallback.
pub struct UsageResolver {
    by_tag: HashMap<String, Vec<UsageFact>>,
}

impl UsageResolver {
    pub fn new(facts: &[UsageFact]) -> Self {
        let mut by_tag: HashMap<String, Vec<UsageFact>> = HashMap::new();
        for fact in facts {
            by_tag.entry(fact.docker_tag().to_string()).or_default().push(fact.clone());
        }
        Self { by_tag }
    }

    /// Registry tags of the form `<objectId>-<v>-<timestamp>_<uid>` may be
    /// absent from the snapshot, which holds the simpler `<objectId>-<v>`.
    /// When a direct lookup misses, split on the first `-` and scan for any
    /// snapshot tag sharing that ObjectID prefix that the registry tag
    /// itself extends.
    fn resolve_facts(&self, tag: &str) -> Vec<UsageFact> {
        if let Some(facts) = self.by_tag.get(tag) {
            return facts.clone();
        }
        let Some((object_id, _)) = tag.split_once('-') else {
            return Vec::new();
        };
        for (snapshot_tag, facts) in &self.by_tag {
            if !snapshot_tag.starts_with(object_id) {
                continue;
            }
            if tag.starts_with(&format!("{snapshot_tag}-")) {
                return facts.clone();
            }
        }
        Vec::new()
    }

    /// Produces the structured usage record and `in_use` verdict for one
    /// tag, honoring the optional recency window. `recency_days = None`
    /// disables the recency filter entirely (any usage at all counts as
    /// in-use).
    pub fn resolve(&self, tag: &str, recency_days: Option<i64>) -> UsageRecord {
        let facts = self.resolve_facts(tag);

        let mut runs = Vec::new();
        let mut workspaces = Vec::new();
        let mut models = Vec::new();
        let mut scheduler_jobs = Vec::new();
        let mut projects = Vec::new();
        let mut organizations = Vec::new();
        let mut app_versions = Vec::new();

        for fact in &facts {
            match fact {
                UsageFact::Run(_) => runs.push(fact.clone()),
                UsageFact::Workspace(_) => workspaces.push(fact.clone()),
                UsageFact::Model(_) => models.push(fact.clone()),
                UsageFact::SchedulerJob(c) => scheduler_jobs.push(c.reference_id.clone()),
                UsageFact::Project(c) => projects.push(c.reference_id.clone()),
                UsageFact::Organization(c) => organizations.push(c.reference_id.clone()),
                UsageFact::AppVersion(c) => app_versions.push(c.reference_id.clone()),
            }
        }

        let has_configuration_usage = facts.iter().any(|f| f.is_configuration_source());
        let in_use = if has_configuration_usage {
            true
        } else if facts.is_empty() {
            false
        } else {
            match recency_days {
                None => true,
                Some(days) => most_recent_historical_timestamp(&facts)
                    .map(|ts| Utc::now() - ts <= Duration::days(days))
                    .unwrap_or(false),
            }
        };

        let usage_summary = build_usage_summary(&facts, runs.len(), workspaces.len(), models.len(), &scheduler_jobs, &projects, &organizations, &app_versions);

        UsageRecord {
            runs_count: runs.len(),
            workspaces_count: workspaces.len(),
            models_count: models.len(),
            scheduler_jobs,
            projects,
            organizations,
            app_versions,
            runs: runs.into_iter().take(EXAMPLE_CAP).collect(),
            workspaces: workspaces.into_iter().take(EXAMPLE_CAP).collect(),
            models: models.into_iter().take(EXAMPLE_CAP).collect(),
            usage_summary,
            in_use,
        }
    }
}

fn most_recent_historical_timestamp(facts: &[UsageFact]) -> Option<DateTime<Utc>> {
    facts
        .iter()
        .filter_map(|f| match f {
            UsageFact::Run(r) => r.recency_timestamp(),
            UsageFact::Workspace(w) => w.workspace_last_change,
            _ => None,
        })
        .max()
}

fn build_usage_summary(
    facts: &[UsageFact],
    runs: usize,
    workspaces: usize,
    models: usize,
    scheduler_jobs: &[String],
    projects: &[String],
    organizations: &[String],
    app_versions: &[String],
) -> String {
    if facts.is_empty() {
        return "no usage found in runs, workspaces, models, scheduler_jobs, projects, organizations, or app_versions".to_string();
    }
    let mut parts = Vec::new();
    if runs > 0 {
        parts.push(format!("{runs} run(s)"));
    }
    if workspaces > 0 {
        parts.push(format!("{workspaces} workspace(s)"));
    }
    if models > 0 {
        parts.push(format!("{models} model(s)"));
    }
    if !scheduler_jobs.is_empty() {
        parts.push(format!("{} scheduler job(s)", scheduler_jobs.len()));
    }
    if !projects.is_empty() {
        parts.push(format!("{} project(s)", projects.len()));
    }
    if !organizations.is_empty() {
        parts.push(format!("{} organization(s)", organizations.len()));
    }
    if !app_versions.is_empty() {
        parts.push(format!("{} app version(s)", app_versions.len()));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mongo::models::{ConfigUsage, RunUsage};

    fn run_fact(tag: &str, completed_days_ago: i64) -> UsageFact {
        UsageFact::Run(RunUsage {
            environment_docker_tag: tag.to_string(),
            run_id: "r1".into(),
            project_id: "p1".into(),
            project_name: "proj".into(),
            project_owner_id: "o1".into(),
            project_owner_name: "owner".into(),
            status: "Succeeded".into(),
            started: Some(Utc::now() - Duration::days(completed_days_ago)),
            completed: Some(Utc::now() - Duration::days(completed_days_ago)),
            last_used: None,
        })
    }

    #[test]
    fn recency_filter_excludes_stale_historical_usage() {
        let facts = vec![run_fact("tag1", 45)];
        let resolver = UsageResolver::new(&facts);
        let record = resolver.resolve("tag1", Some(30));
        assert!(!record.in_use);
    }

    #[test]
    fn configuration_usage_overrides_recency() {
        let facts = vec![
            run_fact("tag1", 45),
            UsageFact::Project(ConfigUsage {
                environment_docker_tag: "tag1".into(),
                reference_id: "proj1".into(),
                reference_name: "Default Project".into(),
            }),
        ];
        let resolver = UsageResolver::new(&facts);
        let record = resolver.resolve("tag1", Some(30));
        assert!(record.in_use);
    }

    #[test]
    fn no_recency_window_means_any_usage_counts() {
        let facts = vec![run_fact("tag1", 400)];
        let resolver = UsageResolver::new(&facts);
        let record = resolver.resolve("tag1", None);
        assert!(record.in_use);
    }

    #[test]
    fn no_usage_at_all_is_not_in_use() {
        let resolver = UsageResolver::new(&[]);
        let record = resolver.resolve("unknown-tag", Some(30));
        assert!(!record.in_use);
        assert!(record.usage_summary.contains("no usage found"));
    }

    #[test]
    fn prefix_fallback_resolves_extended_tags() {
        let facts = vec![run_fact("507f1f77bcf86cd799439011-v2", 1)];
        let resolver = UsageResolver::new(&facts);
        let record = resolver.resolve("507f1f77bcf86cd799439011-v2-1699999999_uid12", Some(30));
        assert!(record.in_use);
        assert_eq!(record.runs_count, 1);
    }

    #[test]
    fn prefix_fallback_does_not_cross_match_unrelated_object_id() {
        let facts = vec![run_fact("507f1f77bcf86cd799439011-v2", 1)];
        let resolver = UsageResolver::new(&facts);
        let record = resolver.resolve("aaaaaaaaaaaaaaaaaaaaaaaa-v2-1699999999_uid12", Some(30));
        assert!(!record.in_use);
        assert_eq!(record.runs_count, 0);
    }
}
