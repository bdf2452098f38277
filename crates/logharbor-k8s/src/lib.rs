//! Kubernetes-backed implementations of the two external collaborators the
//! streaming fabric consumes from the cluster: the resource inventory and
//! the upstream log source.

pub mod inventory;
pub mod kube_inventory;
pub mod log_source;

pub use inventory::{AppKind, AppRef, InventoryError, LabelSelector, PodInfo, ResourceInventory};
pub use kube_inventory::KubeResourceInventory;
pub use log_source::{KubeLogSource, LogLineStream, UpstreamLogSource};
