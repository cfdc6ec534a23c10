//! Container to pod identity.
//!
//! [`WorkloadIndex`] answers "which pod owns this container", fed by the
//! [`KubePodWatcher`] with the pods bound to this node.

use core::error::Error;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

pub mod kube_client;
pub mod pod_watcher;

pub use pod_watcher::KubePodWatcher;

#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch pods: {message}")]
    WatchFailed { message: String },
}

impl Error for KubernetesError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub pod_name: String,
    pub pod_namespace: String,
    pub requested_metagpus: u32,
}

/// What the index keeps per pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodWorkload {
    pub identity: WorkloadIdentity,
    pub container_ids: Vec<String>,
}

impl PodWorkload {
    /// Extracts the identity of `pod`, `None` when it has no name.
    pub fn from_pod(pod: &Pod, resource_name: &str) -> Option<Self> {
        let pod_name = pod.metadata.name.clone()?;
        let pod_namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let requested_metagpus = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|container| requested_units(container, resource_name))
                    .sum()
            })
            .unwrap_or(0);

        let container_ids = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .filter_map(|status| status.container_id.as_deref())
                    .filter_map(strip_runtime_scheme)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            identity: WorkloadIdentity {
                pod_name,
                pod_namespace,
                requested_metagpus,
            },
            container_ids,
        })
    }

    fn key(&self) -> (String, String) {
        (
            self.identity.pod_namespace.clone(),
            self.identity.pod_name.clone(),
        )
    }
}

/// `containerd://<id>` → `<id>`
fn strip_runtime_scheme(container_id: &str) -> Option<String> {
    let id = container_id
        .split_once("://")
        .map_or(container_id, |(_, id)| id);
    (!id.is_empty()).then(|| id.to_ascii_lowercase())
}

fn requested_units(container: &Container, resource_name: &str) -> u32 {
    let Some(resources) = container.resources.as_ref() else {
        return 0;
    };
    let quantity = resources
        .limits
        .as_ref()
        .and_then(|limits| limits.get(resource_name))
        .or_else(|| {
            resources
                .requests
                .as_ref()
                .and_then(|requests| requests.get(resource_name))
        });
    match quantity {
        Some(quantity) => quantity.0.trim().parse().unwrap_or_else(|_| {
            warn!(
                container = %container.name,
                quantity = %quantity.0,
                "ignoring non integer metagpu quantity"
            );
            0
        }),
        None => 0,
    }
}

#[derive(Debug, Default)]
struct IndexState {
    pods: HashMap<(String, String), PodWorkload>,
    by_container: Arc<HashMap<String, WorkloadIdentity>>,
}

impl IndexState {
    fn rebuild(&mut self) {
        let by_container = self
            .pods
            .values()
            .flat_map(|pod| {
                pod.container_ids
                    .iter()
                    .map(move |id| (id.clone(), pod.identity.clone()))
            })
            .collect();
        self.by_container = Arc::new(by_container);
    }
}

/// Container id → owning workload, replaced whole on every change.
#[derive(Debug, Default)]
pub struct WorkloadIndex {
    state: RwLock<IndexState>,
}

impl WorkloadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, container_id: &str) -> Option<WorkloadIdentity> {
        self.snapshot().get(container_id).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, WorkloadIdentity>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_container
            .clone()
    }

    pub fn upsert(&self, workload: PodWorkload) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.pods.get(&workload.key()) == Some(&workload) {
            return;
        }
        state.pods.insert(workload.key(), workload);
        state.rebuild();
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.rebuild();
        }
    }

    pub fn replace_all(&self, workloads: impl IntoIterator<Item = PodWorkload>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.pods = workloads
            .into_iter()
            .map(|workload| (workload.key(), workload))
            .collect();
        state.rebuild();
    }
}
