use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub registry: RegistrySettings,
    #[serde(default)]
    pub cluster: ClusterSettings,
    pub mongo: MongoSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub reports: ReportSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub security: SecuritySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    pub url: String,
    pub repository_base: String,
    #[serde(default)]
    pub auth_secret_ref: Option<String>,
    #[serde(default)]
    pub tls_verify: Option<bool>,
}

fn default_registry_workload_name() -> String {
    "docker-registry".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_registry_workload_name")]
    pub registry_workload_name: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default = "default_pod_ready_timeout")]
    pub pod_ready_timeout_secs: u64,
}

fn default_pod_ready_timeout() -> u64 {
    300
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            registry_workload_name: default_registry_workload_name(),
            kubeconfig: None,
            pod_ready_timeout_secs: default_pod_ready_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MongoSettings {
    pub host: String,
    #[serde(default = "default_mongo_port")]
    pub port: u16,
    #[serde(default)]
    pub replica_set: Option<String>,
    pub database: String,
    #[serde(default)]
    pub credential_env_var: Option<String>,
    #[serde(default)]
    pub credential_secret_ref: Option<String>,
}

fn default_mongo_port() -> u16 {
    27017
}

fn default_max_workers() -> usize {
    4
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_output_dir() -> String {
    "/var/reports/registry-gc".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisSettings {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_snapshot_max_age_hours")]
    pub snapshot_max_age_hours: u64,
}

fn default_snapshot_max_age_hours() -> u64 {
    24
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            operation_timeout_secs: default_operation_timeout_secs(),
            output_dir: default_output_dir(),
            snapshot_max_age_hours: default_snapshot_max_age_hours(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_initial_delay_secs() -> f64 {
    1.0
}
fn default_retry_max_delay_secs() -> f64 {
    30.0
}
fn default_retry_base() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_secs")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_retry_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_operation_timeout_secs")]
    pub subprocess_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            initial_delay_secs: default_retry_initial_delay_secs(),
            max_delay_secs: default_retry_max_delay_secs(),
            exponential_base: default_retry_base(),
            jitter: true,
            subprocess_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

fn default_rate() -> u32 {
    10
}
fn default_burst() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate")]
    pub requests_per_sec: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_sec: default_rate(),
            burst: default_burst(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_max_size() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub tag_list_ttl_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub image_inspect_ttl_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub mongo_query_ttl_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub layer_calc_ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tag_list_ttl_secs: default_cache_ttl_secs(),
            image_inspect_ttl_secs: default_cache_ttl_secs(),
            mongo_query_ttl_secs: default_cache_ttl_secs(),
            layer_calc_ttl_secs: default_cache_ttl_secs(),
            max_size: default_cache_max_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportSettings {
    #[serde(default = "default_archived_report_name")]
    pub archived_filename: String,
    #[serde(default = "default_unused_report_name")]
    pub unused_filename: String,
    #[serde(default = "default_deactivated_report_name")]
    pub deactivated_filename: String,
    #[serde(default = "default_orphan_report_name")]
    pub orphan_filename: String,
    #[serde(default = "default_migration_report_name")]
    pub migration_filename: String,
}

fn default_archived_report_name() -> String {
    "archived-gc-report.json".to_string()
}
fn default_unused_report_name() -> String {
    "unused-gc-report.json".to_string()
}
fn default_deactivated_report_name() -> String {
    "deactivated-owner-gc-report.json".to_string()
}
fn default_orphan_report_name() -> String {
    "orphan-gc-report.json".to_string()
}
fn default_migration_report_name() -> String {
    "migration-report.json".to_string()
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            archived_filename: default_archived_report_name(),
            unused_filename: default_unused_report_name(),
            deactivated_filename: default_deactivated_report_name(),
            orphan_filename: default_orphan_report_name(),
            migration_filename: default_migration_report_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackupSettings {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecuritySettings {
    #[serde(default = "default_true")]
    pub dry_run_by_default: bool,
    #[serde(default)]
    pub require_confirmation: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            dry_run_by_default: true,
            require_confirmation: false,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("REGISTRY_GC_CONFIG_DIR").unwrap_or_else(|_| "/config".into());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default.toml", config_dir)))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(Environment::with_prefix("REGISTRY_GC").separator("__"))
            .build()?
            .try_deserialize()?;

        if settings.mongo.host.is_empty() {
            return Err(ConfigError::Message(
                "MongoDB host not configured. Set REGISTRY_GC__MONGO__HOST or [mongo] host in config"
                    .to_string(),
            ));
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_settings_have_sane_defaults() {
        let defaults = AnalysisSettings::default();
        assert_eq!(defaults.max_workers, 4);
        assert_eq!(defaults.operation_timeout_secs, 300);
        assert_eq!(defaults.snapshot_max_age_hours, 24);
    }

    #[test]
    fn security_defaults_to_dry_run() {
        assert!(SecuritySettings::default().dry_run_by_default);
    }
}
