use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::KubernetesError;
use super::PodWorkload;
use super::WorkloadIndex;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keeps the [`WorkloadIndex`] in sync with the pods bound to this node.
pub struct KubePodWatcher {
    client: Client,
    node_name: String,
    resource_name: String,
    index: Arc<WorkloadIndex>,
}

impl KubePodWatcher {
    pub fn new(
        client: Client,
        node_name: String,
        resource_name: String,
        index: Arc<WorkloadIndex>,
    ) -> Self {
        Self {
            client,
            node_name,
            resource_name,
            index,
        }
    }

    /// Watches until cancelled, restarting the watch after failures.
    #[tracing::instrument(skip_all, fields(node_name = %self.node_name))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");
        restart_until_cancelled(&token, || self.watch_pods()).await;
        Ok(())
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => apply_event(&self.index, &self.resource_name, event),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }
}

/// Runs `watch` again after [`RETRY_DELAY`] whenever it ends, until `token`
/// is cancelled.
async fn restart_until_cancelled<F, Fut>(token: &CancellationToken, mut watch: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Report<KubernetesError>>>,
{
    loop {
        select! {
            _ = token.cancelled() => {
                info!("Pod watcher shutdown requested");
                return;
            }
            result = watch() => match result {
                Ok(()) => warn!("Pod watch stream ended unexpectedly, restarting"),
                Err(e) => error!("Pod watch failed: {e:?}"),
            }
        }
        select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

fn apply_event(index: &WorkloadIndex, resource_name: &str, event: Event<Pod>) {
    match event {
        Event::Applied(pod) => {
            if let Some(workload) = PodWorkload::from_pod(&pod, resource_name) {
                debug!(
                    pod_name = %workload.identity.pod_name,
                    pod_namespace = %workload.identity.pod_namespace,
                    containers = workload.container_ids.len(),
                    "pod applied"
                );
                index.upsert(workload);
            }
        }
        Event::Deleted(pod) => {
            if let Some(name) = pod.metadata.name.as_deref() {
                let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
                debug!(pod_name = %name, pod_namespace = %namespace, "pod deleted");
                index.remove(namespace, name);
            }
        }
        Event::Restarted(pods) => {
            info!(pods = pods.len(), "pod watch (re)started, rebuilding workload index");
            index.replace_all(
                pods.iter()
                    .filter_map(|pod| PodWorkload::from_pod(pod, resource_name)),
            );
        }
    }
}
