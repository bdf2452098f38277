use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{DynamicObject, GroupVersionKind, ListParams};

use crate::inventory::{AppKind, AppRef, InventoryError, LabelSelector, PodInfo, ResourceInventory};

/// [`ResourceInventory`] backed by a live `kube::Client`. Grounded on
/// `kubescope::k8s::KubeClient`'s deployment/pod listing and selector
/// handling, generalized from "deployment only" to any [`AppKind`].
pub struct KubeResourceInventory {
    client: kube::Client,
}

impl KubeResourceInventory {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pod_to_info(pod: Pod) -> PodInfo {
        let name = pod.metadata.name.unwrap_or_default();
        let mut ready = false;
        let mut restart_count = 0;

        if let Some(status) = pod.status {
            if let Some(conditions) = status.conditions {
                ready = conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True");
            }
            if let Some(statuses) = status.container_statuses {
                restart_count = statuses.iter().map(|cs| cs.restart_count).sum();
            }
        }

        PodInfo { name, ready, restart_count }
    }
}

#[async_trait]
impl ResourceInventory for KubeResourceInventory {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, InventoryError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(Self::pod_to_info).collect())
    }

    async fn resolve_app_selector(&self, namespace: &str, app: &AppRef) -> Result<LabelSelector, InventoryError> {
        let not_found = || InventoryError::NotFound {
            namespace: namespace.to_string(),
            kind: app.kind.clone(),
            name: app.name.clone(),
        };

        let match_labels = match &app.kind {
            AppKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let deploy = api.get(&app.name).await.map_err(|_| not_found())?;
                deploy.spec.and_then(|s| s.selector.match_labels).unwrap_or_default()
            }
            AppKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let sts = api.get(&app.name).await.map_err(|_| not_found())?;
                sts.spec.and_then(|s| s.selector.match_labels).unwrap_or_default()
            }
            AppKind::Custom(kind) => {
                let gvk = GroupVersionKind::gvk("", "v1", kind);
                let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &gvk)
                    .await
                    .map_err(|_| not_found())?;
                let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
                let obj = api.get(&app.name).await.map_err(|_| not_found())?;
                obj.data
                    .get("spec")
                    .and_then(|s| s.get("selector"))
                    .and_then(|s| s.get("matchLabels"))
                    .and_then(|m| m.as_object())
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };

        Ok(LabelSelector(match_labels.into_iter().collect()))
    }

    async fn list_pods_matching(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<PodInfo>, InventoryError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let query = selector.to_query();
        let params = if query.is_empty() { ListParams::default() } else { ListParams::default().labels(&query) };
        let list = pods.list(&params).await?;
        Ok(list.items.into_iter().map(Self::pod_to_info).collect())
    }
}

impl From<kube::Error> for InventoryError {
    fn from(e: kube::Error) -> Self {
        InventoryError::Other(e.into())
    }
}
