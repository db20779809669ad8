pub mod cache;
pub mod client;
pub mod credentials;
pub mod errors;
pub mod rate_limit;
pub mod retry;

pub use client::{InspectedImage, LayerRef, RegistryClient};
pub use credentials::RegistryCredentials;
pub use errors::RegistryError;

use async_trait::async_trait;

/// Contract over "list tags / inspect manifest / delete manifest / copy
/// manifest" that every caller (inspection, deletion, backup, migration) depends on. A single
/// implementation backs all of them so the rate limiter and retry policy
/// are shared, never duplicated per call site.
#[async_trait]
pub trait RegistryOperations: Send + Sync {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;

    async fn inspect(&self, repository: &str, tag: &str) -> Result<InspectedImage, RegistryError>;

    /// Returns `true` on an actual delete, `false` when the manifest was
    /// already gone (image-not-found treated as success-noop).
    async fn delete(&self, repository: &str, tag: &str) -> Result<bool, RegistryError>;

    async fn copy(
        &self,
        src_repository: &str,
        src_tag: &str,
        dest_repository: &str,
        dest_tag: &str,
        dest: &dyn DestinationTarget,
    ) -> Result<(), RegistryError>;
}

/// Destination side of a `copy` operation: a different registry host with
/// its own credentials and TLS policy.
#[async_trait]
pub trait DestinationTarget: Send + Sync {
    fn registry_url(&self) -> &str;
    fn tls_verify(&self) -> bool;
    async fn credentials(&self) -> Result<RegistryCredentials, RegistryError>;
}
