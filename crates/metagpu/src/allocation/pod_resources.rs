use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use device_api::podresources::v1::pod_resources_lister_client::PodResourcesListerClient;
use device_api::podresources::v1::ListPodResourcesRequest;
use device_api::podresources::v1::ListPodResourcesResponse;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::AllocationTracker;
use super::PodRef;
use crate::uds::connect_unix;
use crate::workload::KubernetesError;

/// Polls the kubelet pod-resources API for units of our resource in use.
pub struct PodResourcesWatcher {
    socket_path: PathBuf,
    resource_name: String,
    tracker: Arc<AllocationTracker>,
}

impl PodResourcesWatcher {
    pub fn new(socket_path: PathBuf, resource_name: String, tracker: Arc<AllocationTracker>) -> Self {
        Self {
            socket_path,
            resource_name,
            tracker,
        }
    }

    /// Lists pod resources once and feeds the tracker, returns the allocated unit count.
    pub async fn sync_once(&self) -> Result<usize, Report<KubernetesError>> {
        let channel = connect_unix(&self.socket_path).await.map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!(
                    "Failed to connect to kubelet pod-resources socket {}: {e}",
                    self.socket_path.display()
                ),
            })
        })?;
        let mut client = PodResourcesListerClient::new(channel);

        let response = client
            .list(tonic::Request::new(ListPodResourcesRequest {}))
            .await
            .map_err(|e| {
                Report::new(KubernetesError::ConnectionFailed {
                    message: format!("Failed to list pod resources: {e}"),
                })
            })?
            .into_inner();

        let observed = collect_assignments(&response, &self.resource_name);
        let allocated = observed.len();
        self.tracker.set_observed(observed);
        Ok(allocated)
    }

    #[tracing::instrument(skip_all, fields(socket = %self.socket_path.display()))]
    pub async fn run(&self, period: Duration, token: CancellationToken) {
        info!("Starting pod resources watcher");
        loop {
            match self.sync_once().await {
                Ok(allocated) => debug!(allocated, "synced metagpu allocations"),
                Err(e) => warn!("Failed to sync metagpu allocations: {e:?}"),
            }
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod resources watcher shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

/// Unit ids of `resource_name` mapped to the pod holding them.
pub fn collect_assignments(
    response: &ListPodResourcesResponse,
    resource_name: &str,
) -> HashMap<String, PodRef> {
    let mut assignments = HashMap::new();
    for pod in &response.pod_resources {
        for container in &pod.containers {
            for devices in container
                .devices
                .iter()
                .filter(|devices| devices.resource_name == resource_name)
            {
                for unit in &devices.device_ids {
                    assignments.insert(
                        unit.clone(),
                        PodRef {
                            namespace: pod.namespace.clone(),
                            name: pod.name.clone(),
                        },
                    );
                }
            }
        }
    }
    assignments
}
