use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const DELETE_ENABLED_ENV_VAR: &str = "REGISTRY_STORAGE_DELETE_ENABLED";
const FIELD_MANAGER: &str = "registry-gc";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to patch workload {workload}: {source}")]
    Patch { workload: String, source: kube::Error },
    #[error("timed out waiting for pod readiness after patching {workload}")]
    ReadinessTimeout { workload: String },
}

/// In-cluster registry delete-mode toggle, patched onto a StatefulSet then
/// waited for pod readiness via `Api<...>::patch` + poll-until-ready. A
/// no-op construction (`None` at the call site) covers external registries.
pub struct RegistryDeleteModeToggle {
    client: Client,
    namespace: String,
    workload_name: String,
    pod_ready_timeout: Duration,
}

impl RegistryDeleteModeToggle {
    pub fn new(client: Client, namespace: impl Into<String>, workload_name: impl Into<String>, pod_ready_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            workload_name: workload_name.into(),
            pod_ready_timeout,
        }
    }

    async fn patch_env_var(&self, value: Option<&str>) -> Result<(), ClusterError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let env_patch = match value {
            Some(v) => json!({ "name": DELETE_ENABLED_ENV_VAR, "value": v }),
            None => json!({ "name": DELETE_ENABLED_ENV_VAR, "value": null }),
        };
        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": self.workload_name,
                            "env": [env_patch],
                        }]
                    }
                }
            }
        });
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&self.workload_name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|source| ClusterError::Patch {
                workload: self.workload_name.clone(),
                source,
            })?;
        Ok(())
    }

    async fn wait_for_pod_ready(&self) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("app={}", self.workload_name);
        let deadline = Instant::now() + self.pod_ready_timeout;

        loop {
            let list = pods
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(|source| ClusterError::Patch {
                    workload: self.workload_name.clone(),
                    source,
                })?;
            let any_ready = list.items.iter().any(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
                    .unwrap_or(false)
            });
            if any_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::ReadinessTimeout {
                    workload: self.workload_name.clone(),
                });
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    /// Enables delete-mode and waits for a ready pod. A patch
    /// failure is logged but non-fatal: the caller proceeds to attempt
    /// deletes regardless, which may still succeed if the flag was already
    /// on from a previous run.
    pub async fn enable(&self) {
        if let Err(e) = self.patch_env_var(Some("true")).await {
            warn!(error = %e, workload = %self.workload_name, "failed to enable registry delete-mode, continuing anyway");
            return;
        }
        if let Err(e) = self.wait_for_pod_ready().await {
            warn!(error = %e, workload = %self.workload_name, "registry pod did not report ready after enabling delete-mode");
            return;
        }
        info!(workload = %self.workload_name, "registry delete-mode enabled");
    }

    /// Reverses delete-mode. Always attempted in the orchestrator's
    /// try/finally block, idempotent when the flag was never set.
    pub async fn disable(&self) {
        if let Err(e) = self.patch_env_var(None).await {
            warn!(error = %e, workload = %self.workload_name, "failed to disable registry delete-mode");
            return;
        }
        if let Err(e) = self.wait_for_pod_ready().await {
            warn!(error = %e, workload = %self.workload_name, "registry pod did not report ready after disabling delete-mode");
        }
        info!(workload = %self.workload_name, "registry delete-mode disabled");
    }
}
