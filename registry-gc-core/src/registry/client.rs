use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, header::HeaderValue, header::ACCEPT, Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::cache::RegistryCaches;
use crate::registry::credentials::{CredentialSource, RegistryCredentials};
use crate::registry::errors::RegistryError;
use crate::registry::rate_limit::SharedRateLimiter;
use crate::registry::retry::with_retry;
use crate::registry::{DestinationTarget, RegistryOperations};
use crate::settings::{RateLimitSettings, RetrySettings};

const MANIFEST_ACCEPT: &str =
    "application/vnd.docker.distribution.manifest.v2+json,application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRef {
    pub digest: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectedImage {
    pub digest: String,
    pub layers: Vec<LayerRef>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestLayerEntry {
    digest: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    layers: Vec<ManifestLayerEntry>,
}

/// HTTP client over the OCI/Docker v2 Registry API, wrapping every call in
/// the shared rate limiter and retry policy. This is the single
/// implementation the layer graph builder, deletion orchestrator, backup
/// adapter, and migration engine all depend on.
pub struct RegistryClient {
    http: Client,
    base_url: Url,
    rate_limiter: SharedRateLimiter,
    retry_settings: RetrySettings,
    credentials: Arc<dyn CredentialSource>,
    caches: RegistryCaches,
    tls_verify: bool,
}

impl RegistryClient {
    pub fn new(
        base_url: Url,
        credentials: Arc<dyn CredentialSource>,
        rate_limit_settings: &RateLimitSettings,
        retry_settings: RetrySettings,
        caches: RegistryCaches,
        tls_verify: bool,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!tls_verify)
            .build()?;
        Ok(Self {
            http,
            base_url,
            rate_limiter: SharedRateLimiter::new(rate_limit_settings),
            retry_settings,
            credentials,
            caches,
            tls_verify,
        })
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> Result<Url, RegistryError> {
        self.base_url
            .join(&format!("/v2/{repository}/manifests/{reference}"))
            .map_err(|e| RegistryError::InvalidReference(e.to_string()))
    }

    fn tags_url(&self, repository: &str) -> Result<Url, RegistryError> {
        self.base_url
            .join(&format!("/v2/{repository}/tags/list"))
            .map_err(|e| RegistryError::InvalidReference(e.to_string()))
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        headers
    }

    fn apply_auth(
        builder: reqwest::RequestBuilder,
        creds: &RegistryCredentials,
    ) -> reqwest::RequestBuilder {
        if let Some(token) = &creds.bearer_token {
            builder.bearer_auth(token)
        } else if !creds.username.is_empty() {
            builder.basic_auth(&creds.username, Some(creds.password.clone()))
        } else {
            builder
        }
    }

    async fn list_tags_once(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        self.rate_limiter.acquire().await;
        let creds = self
            .credentials
            .resolve()
            .await
            .map_err(|e| RegistryError::Auth {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;
        let url = self.tags_url(repository)?;
        let request = Self::apply_auth(self.http.get(url).headers(Self::headers()), &creds);
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::classify(repository, "_catalog", &e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ImageNotFound {
                repository: repository.to_string(),
                tag: "*".to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| RegistryError::classify(repository, "*", &e.to_string()))?;
        let body: TagListResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Transient {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;
        Ok(body.tags)
    }

    async fn inspect_once(&self, repository: &str, tag: &str) -> Result<InspectedImage, RegistryError> {
        self.rate_limiter.acquire().await;
        let creds = self
            .credentials
            .resolve()
            .await
            .map_err(|e| RegistryError::Auth {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;
        let url = self.manifest_url(repository, tag)?;
        let request = Self::apply_auth(self.http.get(url).headers(Self::headers()), &creds);
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::classify(repository, tag, &e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ImageNotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            });
        }
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let response = response
            .error_for_status()
            .map_err(|e| RegistryError::classify(repository, tag, &e.to_string()))?;
        let manifest: ManifestResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Transient {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;
        let layers = manifest
            .layers
            .into_iter()
            .map(|l| LayerRef {
                digest: l.digest,
                size_bytes: l.size,
            })
            .collect();
        Ok(InspectedImage { digest, layers })
    }

    async fn delete_once(&self, repository: &str, tag: &str) -> Result<bool, RegistryError> {
        self.rate_limiter.acquire().await;
        let creds = self
            .credentials
            .resolve()
            .await
            .map_err(|e| RegistryError::Auth {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;

        // Delete requires the digest, not the tag; resolve it with a HEAD
        // request first the way the registry protocol requires.
        let head_url = self.manifest_url(repository, tag)?;
        let head_request = Self::apply_auth(self.http.head(head_url).headers(Self::headers()), &creds);
        let head_response = head_request
            .send()
            .await
            .map_err(|e| RegistryError::classify(repository, tag, &e.to_string()))?;

        if head_response.status() == StatusCode::NOT_FOUND {
            info!(repository, tag, "image already absent during delete, treating as success");
            return Ok(false);
        }
        let digest = head_response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Transient {
                repository: repository.to_string(),
                message: "registry did not return docker-content-digest header".to_string(),
            })?
            .to_string();

        let delete_url = self.manifest_url(repository, &digest)?;
        let delete_request = Self::apply_auth(self.http.delete(delete_url).headers(Self::headers()), &creds);
        let delete_response = delete_request
            .send()
            .await
            .map_err(|e| RegistryError::classify(repository, tag, &e.to_string()))?;

        if delete_response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        delete_response
            .error_for_status()
            .map_err(|e| RegistryError::classify(repository, tag, &e.to_string()))?;

        self.caches.invalidate(repository, tag).await;
        Ok(true)
    }
}

#[async_trait]
impl RegistryOperations for RegistryClient {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        if let Some(cached) = self.caches.get_tag_list(repository).await {
            return Ok((*cached).clone());
        }
        let tags = with_retry(&self.retry_settings, repository, || self.list_tags_once(repository)).await?;
        self.caches.put_tag_list(repository, Arc::new(tags.clone())).await;
        Ok(tags)
    }

    async fn inspect(&self, repository: &str, tag: &str) -> Result<InspectedImage, RegistryError> {
        if let Some(cached) = self.caches.get_inspect(repository, tag).await {
            return Ok((*cached).clone());
        }
        let image = with_retry(&self.retry_settings, repository, || self.inspect_once(repository, tag)).await?;
        self.caches.put_inspect(repository, tag, Arc::new(image.clone())).await;
        Ok(image)
    }

    async fn delete(&self, repository: &str, tag: &str) -> Result<bool, RegistryError> {
        match with_retry(&self.retry_settings, repository, || self.delete_once(repository, tag)).await {
            Ok(deleted) => Ok(deleted),
            Err(e) if e.is_not_found() => {
                debug!(repository, tag, "delete target already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn copy(
        &self,
        src_repository: &str,
        src_tag: &str,
        dest_repository: &str,
        dest_tag: &str,
        dest: &dyn DestinationTarget,
    ) -> Result<(), RegistryError> {
        self.rate_limiter.acquire().await;
        let src_creds = self
            .credentials
            .resolve()
            .await
            .map_err(|e| RegistryError::Auth {
                repository: src_repository.to_string(),
                message: e.to_string(),
            })?;
        let src_url = self.manifest_url(src_repository, src_tag)?;
        let pull_request = Self::apply_auth(self.http.get(src_url).headers(Self::headers()), &src_creds);
        let pull_response = pull_request
            .send()
            .await
            .map_err(|e| RegistryError::classify(src_repository, src_tag, &e.to_string()))?;
        if pull_response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::ImageNotFound {
                repository: src_repository.to_string(),
                tag: src_tag.to_string(),
            });
        }
        let content_type = pull_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
            .to_string();
        let manifest_bytes = pull_response
            .error_for_status()
            .map_err(|e| RegistryError::classify(src_repository, src_tag, &e.to_string()))?
            .bytes()
            .await
            .map_err(|e| RegistryError::Transient {
                repository: src_repository.to_string(),
                message: e.to_string(),
            })?;

        let dest_base = Url::parse(dest.registry_url()).map_err(|e| RegistryError::InvalidReference(e.to_string()))?;
        let dest_url = dest_base
            .join(&format!("/v2/{dest_repository}/manifests/{dest_tag}"))
            .map_err(|e| RegistryError::InvalidReference(e.to_string()))?;
        let dest_creds = dest.credentials().await?;
        let push_client = if dest.tls_verify() == self.tls_verify {
            self.http.clone()
        } else {
            Client::builder()
                .danger_accept_invalid_certs(!dest.tls_verify())
                .build()
                .map_err(|e| RegistryError::Transient {
                    repository: dest_repository.to_string(),
                    message: e.to_string(),
                })?
        };
        let push_request = Self::apply_auth(
            push_client
                .put(dest_url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(manifest_bytes),
            &dest_creds,
        );
        let push_response = push_request
            .send()
            .await
            .map_err(|e| RegistryError::classify(dest_repository, dest_tag, &e.to_string()))?;
        push_response
            .error_for_status()
            .map_err(|e| RegistryError::classify(dest_repository, dest_tag, &e.to_string()))?;

        warn!(
            src = %format!("{}:{}", src_repository, src_tag),
            dest = %format!("{}:{}", dest_repository, dest_tag),
            "copy does not transfer referenced blobs that are not already present on the destination"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::credentials::SecretStoreCredentialSource;
    use crate::settings::{CacheSettings, RateLimitSettings};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn retry_settings() -> RetrySettings {
        RetrySettings {
            max_attempts: 2,
            initial_delay_secs: 0.001,
            max_delay_secs: 0.002,
            exponential_base: 2.0,
            jitter: false,
            subprocess_timeout_secs: 5,
        }
    }

    async fn client_for(server: &MockServer) -> RegistryClient {
        let creds: Arc<dyn CredentialSource> = Arc::new(SecretStoreCredentialSource {
            secret_ref: None,
            fallback: RegistryCredentials::anonymous(),
        });
        RegistryClient::new(
            Url::parse(&server.uri()).unwrap(),
            creds,
            &RateLimitSettings {
                enabled: false,
                requests_per_sec: 10,
                burst: 10,
            },
            retry_settings(),
            RegistryCaches::disabled(),
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn list_tags_returns_registry_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/env/foo/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tags": ["v1", "v2"]
            })))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let tags = client.list_tags("env/foo").await.unwrap();
        assert_eq!(tags, vec!["v1".to_string(), "v2".to_string()]);
    }

    #[tokio::test]
    async fn inspect_not_found_is_classified_correctly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/env/foo/manifests/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let err = client.inspect("env/foo", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_of_already_absent_tag_returns_false_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v2/env/foo/manifests/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let deleted = client.delete("env/foo", "gone").await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn delete_success_resolves_digest_then_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v2/env/foo/manifests/v1"))
            .respond_with(ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:abc"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/env/foo/manifests/sha256:abc"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let deleted = client.delete("env/foo", "v1").await.unwrap();
        assert!(deleted);
    }
}
