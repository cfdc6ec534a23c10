use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::inventory::DeviceInventory;
use crate::telemetry::PhysicalDevice;
use crate::telemetry::ProcessInspector;
use crate::telemetry::TelemetryError;
use crate::telemetry::TelemetryProvider;
use crate::workload::WorkloadIndex;

/// A compute process together with the workload that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProcess {
    pub pid: u32,
    pub user: String,
    pub command_line: String,
    pub gpu_memory_bytes: u64,
    pub device_uuid: String,
    pub container_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub requested_metagpus: u32,
    pub device_utilization_percent: u32,
    pub device_memory_utilization_percent: u32,
}

/// Which pods' processes a caller gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessScope {
    AllPods,
    Pod(String),
}

impl ProcessScope {
    pub fn admits(&self, process: &DeviceProcess) -> bool {
        match self {
            Self::AllPods => true,
            Self::Pod(pod) => process.pod_name == *pod,
        }
    }
}

/// Result of one poll cycle, processes grouped by device in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub devices: BTreeMap<String, Vec<DeviceProcess>>,
}

impl ProcessSnapshot {
    /// Devices mapped to the processes `scope` admits.
    ///
    /// Scoped to a pod, devices without a matching process are left out.
    pub fn filtered(&self, scope: &ProcessScope) -> BTreeMap<String, Vec<DeviceProcess>> {
        self.devices
            .iter()
            .filter_map(|(uuid, processes)| {
                let admitted: Vec<DeviceProcess> = processes
                    .iter()
                    .filter(|process| scope.admits(process))
                    .cloned()
                    .collect();
                (matches!(scope, ProcessScope::AllPods) || !admitted.is_empty())
                    .then(|| (uuid.clone(), admitted))
            })
            .collect()
    }

    /// Processes in device order, then discovery order.
    pub fn flatten(&self, scope: &ProcessScope) -> Vec<DeviceProcess> {
        self.filtered(scope).into_values().flatten().collect()
    }

    pub fn find(&self, pid: u32) -> Option<&DeviceProcess> {
        self.devices
            .values()
            .flat_map(|processes| processes.iter())
            .find(|process| process.pid == pid)
    }
}

/// Latest view of the compute processes running on this node's devices.
pub struct ProcessRegistry {
    provider: Arc<dyn TelemetryProvider>,
    inspector: Arc<dyn ProcessInspector>,
    workloads: Arc<WorkloadIndex>,
    inventory: Arc<DeviceInventory>,
    snapshot: RwLock<Arc<ProcessSnapshot>>,
}

impl ProcessRegistry {
    pub fn new(
        provider: Arc<dyn TelemetryProvider>,
        inspector: Arc<dyn ProcessInspector>,
        workloads: Arc<WorkloadIndex>,
        inventory: Arc<DeviceInventory>,
    ) -> Self {
        Self {
            provider,
            inspector,
            workloads,
            inventory,
            snapshot: RwLock::new(Arc::new(ProcessSnapshot::default())),
        }
    }

    pub async fn latest(&self) -> Arc<ProcessSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn snapshot(&self, scope: &ProcessScope) -> BTreeMap<String, Vec<DeviceProcess>> {
        self.latest().await.filtered(scope)
    }

    /// Polls every cached device once and publishes the result.
    pub async fn refresh(&self) {
        let devices = self.inventory.current().await;
        let provider = Arc::clone(&self.provider);
        let inspector = Arc::clone(&self.inspector);
        let workloads = Arc::clone(&self.workloads);

        let collected = tokio::task::spawn_blocking(move || {
            collect(&devices, provider.as_ref(), inspector.as_ref(), &workloads)
        })
        .await;

        match collected {
            Ok(snapshot) => self.publish(snapshot).await,
            Err(e) => warn!("process discovery task failed: {e}"),
        }
    }

    pub(crate) async fn publish(&self, snapshot: ProcessSnapshot) {
        *self.snapshot.write().await = Arc::new(snapshot);
    }

    /// Terminates `pid`, never retried.
    pub async fn kill(&self, pid: u32) -> Result<(), Report<TelemetryError>> {
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || provider.terminate(pid))
            .await
            .map_err(|e| {
                Report::new(TelemetryError::Terminate {
                    pid,
                    message: format!("termination task failed: {e}"),
                })
            })?
    }

    #[tracing::instrument(skip_all, fields(period = ?period))]
    pub async fn run(&self, period: Duration, token: CancellationToken) {
        loop {
            self.refresh().await;
            tokio::select! {
                _ = token.cancelled() => {
                    info!("process discovery shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

fn collect(
    devices: &[PhysicalDevice],
    provider: &dyn TelemetryProvider,
    inspector: &dyn ProcessInspector,
    workloads: &WorkloadIndex,
) -> ProcessSnapshot {
    let mut snapshot = ProcessSnapshot {
        taken_at: Some(Utc::now()),
        devices: BTreeMap::new(),
    };

    for device in devices {
        let report = match provider.list_processes(&device.id) {
            Ok(report) => report,
            Err(e) => {
                warn!(device = %device.id, "skipping device in process discovery: {e:?}");
                continue;
            }
        };

        let processes = report
            .processes
            .iter()
            .map(|raw| {
                let details = inspector.inspect(raw.pid);
                let identity = details
                    .container_id
                    .as_deref()
                    .and_then(|id| workloads.lookup(id))
                    .unwrap_or_default();
                DeviceProcess {
                    pid: raw.pid,
                    user: details.user,
                    command_line: details.short_cmdline,
                    gpu_memory_bytes: raw.gpu_memory_bytes,
                    device_uuid: device.id.clone(),
                    container_id: details.container_id.unwrap_or_default(),
                    pod_name: identity.pod_name,
                    pod_namespace: identity.pod_namespace,
                    requested_metagpus: identity.requested_metagpus,
                    device_utilization_percent: report.gpu_utilization_percent,
                    device_memory_utilization_percent: report.memory_utilization_percent,
                }
            })
            .collect::<Vec<_>>();

        debug!(device = %device.id, processes = processes.len(), "discovered processes");
        snapshot.devices.insert(device.id.clone(), processes);
    }

    snapshot
}
