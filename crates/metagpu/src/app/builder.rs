use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::allocation::AllocationTracker;
use crate::allocation::PodResourcesWatcher;
use crate::app::Application;
use crate::app::ApplicationServices;
use crate::auth::VisibilityAuthorizer;
use crate::config::ConfigStore;
use crate::config::ConfigWatcher;
use crate::config::StartArgs;
use crate::inventory::DeviceInventory;
use crate::plugin::KubeletRegistrar;
use crate::plugin::MetaGpuPlugin;
use crate::plugin::ResourceRegistrar;
use crate::plugin::StandaloneRegistrar;
use crate::registry::ProcessRegistry;
use crate::service::ManagementService;
use crate::signal::RecalcSignal;
use crate::telemetry::NvmlTelemetry;
use crate::telemetry::ProcfsInspector;
use crate::telemetry::TelemetryProvider;
use crate::topology::TopologyStore;
use crate::workload::kube_client::init_kube_client;
use crate::workload::KubePodWatcher;
use crate::workload::WorkloadIndex;

/// Kubelet and API server facing components, absent when Kubernetes is disabled.
struct KubernetesComponents {
    registrar: Arc<dyn ResourceRegistrar>,
    pod_watcher: Option<Arc<KubePodWatcher>>,
    pod_resources: Option<Arc<PodResourcesWatcher>>,
}

pub struct ApplicationBuilder {
    args: StartArgs,
}

impl ApplicationBuilder {
    pub fn new(args: StartArgs) -> Self {
        Self { args }
    }

    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let config = Arc::new(
            ConfigStore::load(&self.args.config)
                .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e:?}"))?,
        );
        let resource_name = config.current().resource_name.clone();
        let signal = Arc::new(RecalcSignal::new());

        let telemetry: Arc<dyn TelemetryProvider> = Arc::new(
            NvmlTelemetry::init().map_err(|e| anyhow::anyhow!("Failed to initialize NVML: {e:?}"))?,
        );
        let inventory = Arc::new(DeviceInventory::new(telemetry.clone()));
        let workloads = Arc::new(WorkloadIndex::new());
        let tracker = Arc::new(AllocationTracker::new());

        let registry = Arc::new(ProcessRegistry::new(
            telemetry,
            Arc::new(ProcfsInspector::default()),
            workloads.clone(),
            inventory.clone(),
        ));

        let kubernetes = self
            .create_kubernetes_components(&resource_name, workloads, tracker.clone())
            .await?;

        let plugin = Arc::new(MetaGpuPlugin::new(
            config.clone(),
            inventory,
            Arc::new(TopologyStore::new()),
            tracker.clone(),
            kubernetes.registrar,
            signal.clone(),
        ));

        let management = ManagementService::new(
            config.clone(),
            Arc::new(VisibilityAuthorizer::new(config.clone())),
            registry.clone(),
            tracker,
        );

        let services = ApplicationServices {
            config_watcher: Arc::new(ConfigWatcher::new(config.clone(), signal)),
            config,
            plugin,
            registry,
            management,
            pod_watcher: kubernetes.pod_watcher,
            pod_resources: kubernetes.pod_resources,
        };

        Ok(Application::new(services, self.args))
    }

    async fn create_kubernetes_components(
        &self,
        resource_name: &str,
        workloads: Arc<WorkloadIndex>,
        tracker: Arc<AllocationTracker>,
    ) -> Result<KubernetesComponents> {
        if !self.args.enable_k8s {
            tracing::warn!("Kubernetes integration disabled, processes carry no pod identity");
            return Ok(KubernetesComponents {
                registrar: Arc::new(StandaloneRegistrar),
                pod_watcher: None,
                pod_resources: None,
            });
        }

        let node_name = self
            .args
            .node_name
            .clone()
            .context("--node-name is required when the Kubernetes integration is enabled")?;
        let client = init_kube_client(self.args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e:?}"))?;

        Ok(KubernetesComponents {
            registrar: Arc::new(KubeletRegistrar::new(
                self.args.kubelet_plugin_dir.clone(),
                resource_name.to_string(),
            )),
            pod_watcher: Some(Arc::new(KubePodWatcher::new(
                client,
                node_name,
                resource_name.to_string(),
                workloads,
            ))),
            pod_resources: Some(Arc::new(PodResourcesWatcher::new(
                self.args.kubelet_pod_resources_socket.clone(),
                resource_name.to_string(),
                tracker,
            ))),
        })
    }
}
