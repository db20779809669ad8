use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::registry::{RegistryError, RegistryOperations};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("registry error backing up {repository}:{tag}: {source}")]
    Registry {
        repository: String,
        tag: String,
        source: RegistryError,
    },
    #[error("object storage error backing up {repository}:{tag}: {message}")]
    Storage { repository: String, tag: String, message: String },
    #[error("failed to archive {repository}:{tag}: {message}")]
    Archive { repository: String, tag: String, message: String },
}

/// Object-storage destination for one backed-up tag. A thin boundary so the
/// adapter is testable without a live S3 bucket, the way the registry
/// client's `DestinationTarget` trait decouples copy from a concrete host.
#[async_trait::async_trait]
pub trait BackupDestination: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), String>;
}

pub struct S3BackupDestination {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BackupDestination {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait::async_trait]
impl BackupDestination for S3BackupDestination {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Copies each surviving tag to object storage as a tar archive before the
/// orchestrator deletes anything, honoring the same rate-limit/retry policy
/// as the registry client because it calls through the same
/// `RegistryOperations` handle. A single failure aborts the whole backup
/// run; the orchestrator treats that as fatal and performs zero registry
/// deletions.
pub struct BackupAdapter {
    registry: Arc<dyn RegistryOperations>,
    destination: Arc<dyn BackupDestination>,
}

impl BackupAdapter {
    pub fn new(registry: Arc<dyn RegistryOperations>, destination: Arc<dyn BackupDestination>) -> Self {
        Self { registry, destination }
    }

    /// Archives one tag's manifest and layer digests as a tar entry and
    /// uploads it. Full blob content is out of scope here: the archive
    /// records enough to restore authoritative knowledge of what existed
    /// (digest, size, tag) for disaster recovery audits.
    async fn backup_one(&self, repository: &str, tag: &str) -> Result<(), BackupError> {
        let inspected = self
            .registry
            .inspect(repository, tag)
            .await
            .map_err(|source| BackupError::Registry {
                repository: repository.to_string(),
                tag: tag.to_string(),
                source,
            })?;

        let manifest_json = serde_json::to_vec_pretty(&inspected).map_err(|e| BackupError::Archive {
            repository: repository.to_string(),
            tag: tag.to_string(),
            message: e.to_string(),
        })?;

        let archive_bytes = build_tar(&manifest_json).map_err(|e| BackupError::Archive {
            repository: repository.to_string(),
            tag: tag.to_string(),
            message: e.to_string(),
        })?;

        let key = format!("{repository}/{tag}.tar");
        self.destination
            .put(&key, archive_bytes)
            .await
            .map_err(|message| BackupError::Storage {
                repository: repository.to_string(),
                tag: tag.to_string(),
                message,
            })
    }

    /// Backs up every `(repository, tag)` pair, returning the count
    /// successfully backed up. Stops and returns the first error — the
    /// orchestrator treats any `Err` here as a total abort before any
    /// registry deletion.
    pub async fn backup_tags(&self, repository: &str, tags: &[String]) -> Result<usize, BackupError> {
        let mut count = 0;
        for tag in tags {
            self.backup_one(repository, tag).await?;
            count += 1;
            info!(repository, tag, "backed up tag to object storage");
        }
        Ok(count)
    }
}

fn build_tar(manifest_json: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "manifest.json", manifest_json)?;
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InspectedImage, LayerRef};
    use std::sync::Mutex;

    struct StubRegistry {
        layers: Vec<LayerRef>,
    }

    #[async_trait::async_trait]
    impl RegistryOperations for StubRegistry {
        async fn list_tags(&self, _repository: &str) -> Result<Vec<String>, RegistryError> {
            Ok(vec![])
        }
        async fn inspect(&self, _repository: &str, tag: &str) -> Result<InspectedImage, RegistryError> {
            Ok(InspectedImage {
                digest: format!("sha256:{tag}"),
                layers: self.layers.clone(),
            })
        }
        async fn delete(&self, _repository: &str, _tag: &str) -> Result<bool, RegistryError> {
            Ok(true)
        }
        async fn copy(
            &self,
            _src_repository: &str,
            _src_tag: &str,
            _dest_repository: &str,
            _dest_tag: &str,
            _dest: &dyn crate::registry::DestinationTarget,
        ) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    struct RecordingDestination {
        keys: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait::async_trait]
    impl BackupDestination for RecordingDestination {
        async fn put(&self, key: &str, _body: Vec<u8>) -> Result<(), String> {
            if self.fail_on.as_deref() == Some(key) {
                return Err("simulated storage failure".to_string());
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn backs_up_every_tag_and_returns_count() {
        let registry = Arc::new(StubRegistry {
            layers: vec![LayerRef {
                digest: "sha256:layer1".into(),
                size_bytes: 10,
            }],
        });
        let destination = Arc::new(RecordingDestination {
            keys: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let adapter = BackupAdapter::new(registry, destination.clone());
        let tags = vec!["t1".to_string(), "t2".to_string()];
        let count = adapter.backup_tags("base/environment", &tags).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(destination.keys.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn aborts_on_first_storage_failure_without_completing_remaining_tags() {
        let registry = Arc::new(StubRegistry { layers: vec![] });
        let destination = Arc::new(RecordingDestination {
            keys: Mutex::new(Vec::new()),
            fail_on: Some("base/environment/t1.tar".to_string()),
        });
        let adapter = BackupAdapter::new(registry, destination.clone());
        let tags = vec!["t1".to_string(), "t2".to_string()];
        let result = adapter.backup_tags("base/environment", &tags).await;
        assert!(result.is_err());
        assert_eq!(destination.keys.lock().unwrap().len(), 0);
    }
}
