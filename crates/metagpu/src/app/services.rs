use std::sync::Arc;

use crate::allocation::PodResourcesWatcher;
use crate::config::ConfigStore;
use crate::config::ConfigWatcher;
use crate::plugin::MetaGpuPlugin;
use crate::registry::ProcessRegistry;
use crate::service::ManagementService;
use crate::workload::KubePodWatcher;

/// Long lived components shared by the application tasks.
pub struct ApplicationServices {
    pub config: Arc<ConfigStore>,
    pub config_watcher: Arc<ConfigWatcher>,
    pub plugin: Arc<MetaGpuPlugin>,
    pub registry: Arc<ProcessRegistry>,
    pub management: ManagementService,
    /// Present only with the Kubernetes integration enabled
    pub pod_watcher: Option<Arc<KubePodWatcher>>,
    pub pod_resources: Option<Arc<PodResourcesWatcher>>,
}
