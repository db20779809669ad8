use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;

use crate::candidates::Candidate;
use crate::orchestrator::DeletionResult;
use crate::tag_resolver::RecordType;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report to {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub registry_url: String,
    pub repository: String,
    pub generated_at: DateTime<Utc>,
}

/// Rounds a byte count to GB with 2 decimal places for display. Internal
/// arithmetic (layer graph, freed-space) stays integer throughout;
/// this conversion happens only at the report-writing boundary.
pub fn bytes_to_gb_rounded(bytes: u64) -> f64 {
    let gb = bytes as f64 / 1_073_741_824.0;
    (gb * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub total_candidates: usize,
    pub by_record_type: HashMap<String, usize>,
    pub estimated_freed_bytes: u64,
    pub estimated_freed_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub summary: CandidateSummary,
    pub details: Vec<Candidate>,
    pub metadata: ReportMetadata,
}

impl CandidateReport {
    pub fn new(candidates: Vec<Candidate>, estimated_freed_bytes: u64, metadata: ReportMetadata) -> Self {
        let mut by_record_type: HashMap<String, usize> = HashMap::new();
        for candidate in &candidates {
            *by_record_type.entry(record_type_label(candidate.record_type).to_string()).or_default() += 1;
        }
        Self {
            summary: CandidateSummary {
                total_candidates: candidates.len(),
                by_record_type,
                estimated_freed_bytes,
                estimated_freed_gb: bytes_to_gb_rounded(estimated_freed_bytes),
            },
            details: candidates,
            metadata,
        }
    }

    /// Unused-environment report groups detail by environment ID.
    pub fn grouped_by_environment(&self) -> HashMap<String, Vec<&Candidate>> {
        let mut grouped: HashMap<String, Vec<&Candidate>> = HashMap::new();
        for candidate in &self.details {
            grouped.entry(candidate.object_id.clone()).or_default().push(candidate);
        }
        grouped
    }
}

fn record_type_label(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Environment => "environment",
        RecordType::Revision => "revision",
        RecordType::Model => "model",
        RecordType::Version => "version",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeactivatedOwnerReport {
    pub summary: CandidateSummary,
    pub details_by_owner_email: HashMap<String, Vec<Candidate>>,
    pub metadata: ReportMetadata,
}

impl DeactivatedOwnerReport {
    pub fn new(details_by_owner_email: HashMap<String, Vec<Candidate>>, estimated_freed_bytes: u64, metadata: ReportMetadata) -> Self {
        let all: Vec<&Candidate> = details_by_owner_email.values().flatten().collect();
        let mut by_record_type: HashMap<String, usize> = HashMap::new();
        for candidate in &all {
            *by_record_type.entry(record_type_label(candidate.record_type).to_string()).or_default() += 1;
        }
        let total_candidates = all.len();
        Self {
            summary: CandidateSummary {
                total_candidates,
                by_record_type,
                estimated_freed_bytes,
                estimated_freed_gb: bytes_to_gb_rounded(estimated_freed_bytes),
            },
            details_by_owner_email,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    pub summary: DeletionResult,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReportEntry {
    pub repository: String,
    pub copied: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub summary: MigrationSummary,
    pub details_by_repository: Vec<MigrationReportEntry>,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub repositories: usize,
    pub copied: usize,
    pub failed: usize,
}

/// Writes one JSON report per invocation to `output_dir`, always — even for
/// empty results, so downstream tooling can rely on the file's presence.
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    pub async fn write(&self, filename: &str, report: &impl Serialize) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(&self.output_dir).await.map_err(|e| ReportError::Io {
            path: self.output_dir.display().to_string(),
            source: e,
        })?;
        let path: &Path = self.output_dir.as_ref();
        let full_path = path.join(filename);
        let body = serde_json::to_vec_pretty(report)?;
        fs::write(&full_path, body).await.map_err(|e| ReportError::Io {
            path: full_path.display().to_string(),
            source: e,
        })?;
        Ok(full_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer_graph::ImageType;

    #[test]
    fn bytes_to_gb_rounds_to_two_decimals() {
        assert_eq!(bytes_to_gb_rounded(1_610_612_736), 1.5);
    }

    #[test]
    fn candidate_report_groups_by_environment() {
        let candidates = vec![Candidate {
            object_id: "env1".into(),
            image_type: ImageType::Environment,
            tag: "t1".into(),
            full_image: "t1".into(),
            record_type: RecordType::Environment,
        }];
        let metadata = ReportMetadata {
            registry_url: "https://registry".into(),
            repository: "base".into(),
            generated_at: Utc::now(),
        };
        let report = CandidateReport::new(candidates, 100, metadata);
        assert_eq!(report.summary.total_candidates, 1);
        assert_eq!(report.grouped_by_environment().len(), 1);
    }

    #[tokio::test]
    async fn writes_report_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let metadata = ReportMetadata {
            registry_url: "https://registry".into(),
            repository: "base".into(),
            generated_at: Utc::now(),
        };
        let report = CandidateReport::new(vec![], 0, metadata);
        let path = writer.write("archived-gc-report.json", &report).await.unwrap();
        assert!(path.exists());
    }
}
