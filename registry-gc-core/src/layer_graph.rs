use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::registry::{InspectedImage, RegistryError, RegistryOperations};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageType {
    Environment,
    Model,
}

impl ImageType {
    pub fn repository_segment(&self) -> &'static str {
        match self {
            ImageType::Environment => "environment",
            ImageType::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub image_type: ImageType,
    pub tag: String,
}

#[derive(Debug, Clone)]
struct ImageEntry {
    digest: String,
    layers: Vec<String>,
}

#[derive(Debug, Clone)]
struct LayerEntry {
    size_bytes: u64,
    ref_count: u64,
}

/// Reference-counted graph of every layer across the analyzed image types,
/// built fresh each run since the registry is the source of truth.
/// Answers both point queries (total size of one image) and
/// set queries (bytes freed if a candidate set is deleted).
#[derive(Default)]
pub struct LayerGraph {
    images: HashMap<ImageKey, ImageEntry>,
    layers: HashMap<String, LayerEntry>,
}

const BUILDCACHE_TAG: &str = "buildcache";

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for the given image types by listing tags in each
    /// repository and inspecting them concurrently with up to `workers`
    /// workers, sharing one registry client and therefore one rate limiter.
    /// `allow_list` optionally restricts which ObjectID-bearing tags are
    /// inspected at all.
    pub async fn build(
        registry: Arc<dyn RegistryOperations>,
        repository_base: &str,
        image_types: &[ImageType],
        workers: usize,
        allow_list: Option<&HashSet<String>>,
    ) -> Result<Self, RegistryError> {
        let graph = Arc::new(Mutex::new(LayerGraph::new()));
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        for image_type in image_types {
            let repository = format!("{}/{}", repository_base, image_type.repository_segment());
            let tags = registry.list_tags(&repository).await?;
            let filtered: Vec<String> = tags
                .into_iter()
                .filter(|t| t != BUILDCACHE_TAG)
                .filter(|t| allow_list.map(|allowed| tag_matches_allow_list(t, allowed)).unwrap_or(true))
                .collect();

            let mut handles = Vec::with_capacity(filtered.len());
            for tag in filtered {
                let registry = registry.clone();
                let semaphore = semaphore.clone();
                let graph = graph.clone();
                let repository = repository.clone();
                let image_type = *image_type;
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore not closed");
                    match registry.inspect(&repository, &tag).await {
                        Ok(inspected) => {
                            let mut graph = graph.lock().await;
                            graph.insert_image(image_type, tag, inspected);
                            Ok(())
                        }
                        Err(e) if e.is_not_found() => {
                            warn!(repository, tag, "tag vanished between list-tags and inspect, skipping");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }));
            }
            for handle in handles {
                handle.await.expect("inspection task panicked")?;
            }
        }

        info!("layer graph built");
        Ok(Arc::try_unwrap(graph)
            .unwrap_or_else(|_| panic!("graph still shared after all tasks joined"))
            .into_inner())
    }

    fn insert_image(&mut self, image_type: ImageType, tag: String, inspected: InspectedImage) {
        let layer_digests: Vec<String> = inspected.layers.iter().map(|l| l.digest.clone()).collect();
        for layer in &inspected.layers {
            self.layers
                .entry(layer.digest.clone())
                .and_modify(|e| e.ref_count += 1)
                .or_insert(LayerEntry {
                    size_bytes: layer.size_bytes,
                    ref_count: 1,
                });
        }
        self.images.insert(
            ImageKey { image_type, tag },
            ImageEntry {
                digest: inspected.digest,
                layers: layer_digests,
            },
        );
    }

    pub fn ref_count(&self, layer_digest: &str) -> u64 {
        self.layers.get(layer_digest).map(|l| l.ref_count).unwrap_or(0)
    }

    pub fn total_size(&self, key: &ImageKey) -> Option<u64> {
        let entry = self.images.get(key)?;
        Some(
            entry
                .layers
                .iter()
                .map(|digest| self.layers.get(digest).map(|l| l.size_bytes).unwrap_or(0))
                .sum(),
        )
    }

    /// Bytes freed if every image in `candidates` is deleted, accounting
    /// for layers still referenced by images outside the set. `candidates`
    /// is deduplicated internally by `(image_type, tag)` first — skipping
    /// this step would let `delete_count` exceed `ref_count` and silently
    /// yield zero freed bytes.
    pub fn freed_space_if_deleted(&self, candidates: &[ImageKey]) -> u64 {
        let deduped: HashSet<&ImageKey> = candidates.iter().collect();
        let mut delete_count: HashMap<&str, u64> = HashMap::new();
        for key in &deduped {
            if let Some(entry) = self.images.get(*key) {
                for digest in &entry.layers {
                    *delete_count.entry(digest.as_str()).or_insert(0) += 1;
                }
            }
        }
        let mut freed = 0u64;
        for (digest, count) in delete_count {
            let layer = match self.layers.get(digest) {
                Some(l) => l,
                None => continue,
            };
            if count == layer.ref_count {
                freed += layer.size_bytes;
            }
        }
        freed
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn known_image_keys(&self) -> impl Iterator<Item = &ImageKey> {
        self.images.keys()
    }
}

fn tag_matches_allow_list(tag: &str, allow_list: &HashSet<String>) -> bool {
    allow_list.iter().any(|id| tag == id || tag.starts_with(&format!("{}-", id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(images: Vec<(ImageType, &str, Vec<(&str, u64)>)>) -> LayerGraph {
        let mut graph = LayerGraph::new();
        for (image_type, tag, layers) in images {
            let inspected = InspectedImage {
                digest: format!("sha256:{}", tag),
                layers: layers
                    .into_iter()
                    .map(|(digest, size)| crate::registry::LayerRef {
                        digest: digest.to_string(),
                        size_bytes: size,
                    })
                    .collect(),
            };
            graph.insert_image(image_type, tag.to_string(), inspected);
        }
        graph
    }

    #[test]
    fn freed_space_accounts_for_shared_layers() {
        let graph = graph_with(vec![
            (ImageType::Environment, "A", vec![("L1", 100), ("L2", 50)]),
            (ImageType::Environment, "B", vec![("L2", 50), ("L3", 20)]),
        ]);
        let a = ImageKey {
            image_type: ImageType::Environment,
            tag: "A".into(),
        };
        let b = ImageKey {
            image_type: ImageType::Environment,
            tag: "B".into(),
        };
        assert_eq!(graph.freed_space_if_deleted(&[a.clone()]), 100);
        assert_eq!(graph.freed_space_if_deleted(&[b.clone()]), 20);
        assert_eq!(graph.freed_space_if_deleted(&[a, b]), 170);
    }

    #[test]
    fn ref_count_equals_multiplicity_across_images() {
        let graph = graph_with(vec![
            (ImageType::Environment, "A", vec![("L1", 100)]),
            (ImageType::Environment, "B", vec![("L1", 100)]),
            (ImageType::Model, "C", vec![("L1", 100)]),
        ]);
        assert_eq!(graph.ref_count("L1"), 3);
    }

    #[test]
    fn freed_space_never_exceeds_sum_of_total_sizes() {
        let graph = graph_with(vec![
            (ImageType::Environment, "A", vec![("L1", 100), ("L2", 50)]),
            (ImageType::Environment, "B", vec![("L2", 50), ("L3", 20)]),
        ]);
        let keys: Vec<ImageKey> = graph.known_image_keys().cloned().collect();
        let total: u64 = keys.iter().map(|k| graph.total_size(k).unwrap()).sum();
        assert!(graph.freed_space_if_deleted(&keys) <= total);
    }

    #[test]
    fn deduplicating_candidates_prevents_delete_count_exceeding_ref_count() {
        let graph = graph_with(vec![(ImageType::Environment, "A", vec![("L1", 100)])]);
        let a = ImageKey {
            image_type: ImageType::Environment,
            tag: "A".into(),
        };
        // Passing the same candidate twice must not double the freed total.
        assert_eq!(graph.freed_space_if_deleted(&[a.clone(), a]), 100);
    }

    #[test]
    fn allow_list_matches_by_equality_or_dash_prefix_not_substring() {
        let mut allow = HashSet::new();
        allow.insert("507f1f77bcf86cd799439011".to_string());
        assert!(tag_matches_allow_list("507f1f77bcf86cd799439011-v1", &allow));
        assert!(tag_matches_allow_list("507f1f77bcf86cd799439011", &allow));
        assert!(!tag_matches_allow_list("507f1f77bcf86cd799439011x", &allow));
    }
}
