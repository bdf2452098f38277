use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// A Kubernetes-like workload reference: the "app" an app stream tails.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AppRef {
    pub kind: AppKind,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AppKind {
    Deployment,
    StatefulSet,
    /// A custom resource, named by its kind string (e.g. `"Rollout"`).
    Custom(String),
}

/// A label selector resolved from an [`AppRef`], expressed as exact-match
/// key/value pairs (the subset `matchLabels` covers; sufficient for the
/// selectors this spec's reconciliation loop needs).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn to_query(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
    }
}

/// Minimal view of a pod's readiness and restart history, as derived by the
/// resource inventory from the pod's status.
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    /// The app cannot be resolved to a selector.
    #[error("app '{kind:?}/{name}' not found in namespace '{namespace}'")]
    NotFound { namespace: String, kind: AppKind, name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// External resource inventory: list of pods/apps, selector resolution, and
/// pod status, consumed but not owned by the streaming fabric.
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>, InventoryError>;

    async fn resolve_app_selector(&self, namespace: &str, app: &AppRef) -> Result<LabelSelector, InventoryError>;

    async fn list_pods_matching(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<PodInfo>, InventoryError>;
}
