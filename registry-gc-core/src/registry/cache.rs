use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::registry::client::InspectedImage;
use crate::settings::CacheSettings;

/// TTL/size-bounded caches for tag-list and inspect results, keyed by
/// `(repository, tag?)`. Entries are invalidated on successful delete for
/// that key within the same process.
#[derive(Clone)]
pub struct RegistryCaches {
    tag_list: Option<Cache<String, Arc<Vec<String>>>>,
    inspect: Option<Cache<(String, String), Arc<InspectedImage>>>,
}

impl RegistryCaches {
    pub fn new(settings: &CacheSettings) -> Self {
        if !settings.enabled {
            return Self {
                tag_list: None,
                inspect: None,
            };
        }
        let tag_list = Cache::builder()
            .time_to_live(Duration::from_secs(settings.tag_list_ttl_secs))
            .max_capacity(settings.max_size)
            .build();
        let inspect = Cache::builder()
            .time_to_live(Duration::from_secs(settings.image_inspect_ttl_secs))
            .max_capacity(settings.max_size)
            .build();
        Self {
            tag_list: Some(tag_list),
            inspect: Some(inspect),
        }
    }

    pub fn disabled() -> Self {
        Self {
            tag_list: None,
            inspect: None,
        }
    }

    pub async fn get_tag_list(&self, repository: &str) -> Option<Arc<Vec<String>>> {
        self.tag_list.as_ref()?.get(repository).await
    }

    pub async fn put_tag_list(&self, repository: &str, tags: Arc<Vec<String>>) {
        if let Some(cache) = &self.tag_list {
            cache.insert(repository.to_string(), tags).await;
        }
    }

    pub async fn get_inspect(&self, repository: &str, tag: &str) -> Option<Arc<InspectedImage>> {
        let cache = self.inspect.as_ref()?;
        cache.get(&(repository.to_string(), tag.to_string())).await
    }

    pub async fn put_inspect(&self, repository: &str, tag: &str, image: Arc<InspectedImage>) {
        if let Some(cache) = &self.inspect {
            cache
                .insert((repository.to_string(), tag.to_string()), image)
                .await;
        }
    }

    /// Invalidate both caches for a `(repository, tag)` pair after a
    /// successful delete, so a subsequent inspect within the same process
    /// cannot read stale data.
    pub async fn invalidate(&self, repository: &str, tag: &str) {
        if let Some(cache) = &self.inspect {
            cache.invalidate(&(repository.to_string(), tag.to_string())).await;
        }
        if let Some(cache) = &self.tag_list {
            cache.invalidate(repository).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::client::LayerRef;

    fn settings() -> CacheSettings {
        CacheSettings {
            enabled: true,
            tag_list_ttl_secs: 60,
            image_inspect_ttl_secs: 60,
            mongo_query_ttl_secs: 60,
            layer_calc_ttl_secs: 60,
            max_size: 1000,
        }
    }

    #[tokio::test]
    async fn round_trips_tag_list() {
        let cache = RegistryCaches::new(&settings());
        let tags = Arc::new(vec!["a".to_string(), "b".to_string()]);
        cache.put_tag_list("env/foo", tags.clone()).await;
        let got = cache.get_tag_list("env/foo").await.unwrap();
        assert_eq!(*got, *tags);
    }

    #[tokio::test]
    async fn invalidate_clears_inspect_entry() {
        let cache = RegistryCaches::new(&settings());
        let image = Arc::new(InspectedImage {
            digest: "sha256:abc".into(),
            layers: vec![LayerRef {
                digest: "sha256:l1".into(),
                size_bytes: 10,
            }],
        });
        cache.put_inspect("env/foo", "v1", image).await;
        assert!(cache.get_inspect("env/foo", "v1").await.is_some());
        cache.invalidate("env/foo", "v1").await;
        assert!(cache.get_inspect("env/foo", "v1").await.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let cache = RegistryCaches::disabled();
        cache.put_tag_list("env/foo", Arc::new(vec!["a".into()])).await;
        assert!(cache.get_tag_list("env/foo").await.is_none());
    }
}
