//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::watch;

use crate::plugin::RegistrarError;
use crate::plugin::ResourceRegistrar;
use crate::telemetry::DeviceProcessReport;
use crate::telemetry::PhysicalDevice;
use crate::telemetry::ProcessDetails;
use crate::telemetry::ProcessInspector;
use crate::telemetry::TelemetryError;
use crate::telemetry::TelemetryProvider;
use crate::topology::MetaGpuUnit;

#[derive(Debug, Default)]
struct TelemetryState {
    devices: Vec<PhysicalDevice>,
    processes: HashMap<String, DeviceProcessReport>,
    failing_devices: HashSet<String>,
    fail_inventory: bool,
    fail_kill: bool,
    killed: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct MockTelemetry {
    state: Mutex<TelemetryState>,
}

impl MockTelemetry {
    pub fn with_devices(ids: &[&str]) -> Self {
        let telemetry = Self::default();
        telemetry.set_devices(ids);
        telemetry
    }

    pub fn set_devices(&self, ids: &[&str]) {
        self.state.lock().expect("telemetry lock").devices = ids
            .iter()
            .map(|id| PhysicalDevice {
                id: id.to_string(),
                healthy: true,
            })
            .collect();
    }

    pub fn set_processes(&self, device: &str, report: DeviceProcessReport) {
        self.state
            .lock()
            .expect("telemetry lock")
            .processes
            .insert(device.to_string(), report);
    }

    pub fn fail_inventory(&self, fail: bool) {
        self.state.lock().expect("telemetry lock").fail_inventory = fail;
    }

    pub fn fail_processes(&self, device: &str) {
        self.state
            .lock()
            .expect("telemetry lock")
            .failing_devices
            .insert(device.to_string());
    }

    pub fn fail_kill(&self, fail: bool) {
        self.state.lock().expect("telemetry lock").fail_kill = fail;
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.lock().expect("telemetry lock").killed.clone()
    }
}

impl TelemetryProvider for MockTelemetry {
    fn list_devices(&self) -> Result<Vec<PhysicalDevice>, Report<TelemetryError>> {
        let state = self.state.lock().expect("telemetry lock");
        if state.fail_inventory {
            return Err(Report::new(TelemetryError::DeviceQuery {
                message: "driver unavailable".to_string(),
            }));
        }
        Ok(state.devices.clone())
    }

    fn list_processes(
        &self,
        device_id: &str,
    ) -> Result<DeviceProcessReport, Report<TelemetryError>> {
        let state = self.state.lock().expect("telemetry lock");
        if state.failing_devices.contains(device_id) {
            return Err(Report::new(TelemetryError::ProcessQuery {
                device: device_id.to_string(),
                message: "device lost".to_string(),
            }));
        }
        Ok(state.processes.get(device_id).cloned().unwrap_or_default())
    }

    fn terminate(&self, pid: u32) -> Result<(), Report<TelemetryError>> {
        let mut state = self.state.lock().expect("telemetry lock");
        if state.fail_kill {
            return Err(Report::new(TelemetryError::Terminate {
                pid,
                message: "no such process".to_string(),
            }));
        }
        state.killed.push(pid);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockInspector {
    details: HashMap<u32, ProcessDetails>,
}

impl MockInspector {
    pub fn with(mut self, pid: u32, details: ProcessDetails) -> Self {
        self.details.insert(pid, details);
        self
    }
}

impl ProcessInspector for MockInspector {
    fn inspect(&self, pid: u32) -> ProcessDetails {
        self.details.get(&pid).cloned().unwrap_or_default()
    }
}

/// Records every advertisement; advertising can be held back with [`RecordingRegistrar::close_gate`].
#[derive(Debug)]
pub struct RecordingRegistrar {
    advertised: Mutex<Vec<usize>>,
    withdrawals: Mutex<usize>,
    fail_advertise: Mutex<bool>,
    gate: watch::Sender<bool>,
    arrivals: AtomicUsize,
    registration_lost: AtomicBool,
}

impl Default for RecordingRegistrar {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            advertised: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(0),
            fail_advertise: Mutex::new(false),
            gate,
            arrivals: AtomicUsize::new(0),
            registration_lost: AtomicBool::new(false),
        }
    }
}

impl RecordingRegistrar {
    /// Unit counts of every completed advertisement, in order.
    pub fn advertised(&self) -> Vec<usize> {
        self.advertised.lock().expect("registrar lock").clone()
    }

    pub fn withdrawals(&self) -> usize {
        *self.withdrawals.lock().expect("registrar lock")
    }

    pub fn fail_advertise(&self, fail: bool) {
        *self.fail_advertise.lock().expect("registrar lock") = fail;
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Pretends the node forgot the registration until the next advertisement.
    pub fn lose_registration(&self) {
        self.registration_lost.store(true, Ordering::Release);
    }

    /// Advertisements that reached the gate, finished or not.
    pub fn arrivals(&self) -> usize {
        self.arrivals.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ResourceRegistrar for RecordingRegistrar {
    async fn advertise(&self, units: &[MetaGpuUnit]) -> Result<(), Report<RegistrarError>> {
        self.arrivals.fetch_add(1, Ordering::AcqRel);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if *self.fail_advertise.lock().expect("registrar lock") {
            return Err(Report::new(RegistrarError::Register {
                message: "kubelet unavailable".to_string(),
            }));
        }
        self.advertised
            .lock()
            .expect("registrar lock")
            .push(units.len());
        self.registration_lost.store(false, Ordering::Release);
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), Report<RegistrarError>> {
        *self.withdrawals.lock().expect("registrar lock") += 1;
        Ok(())
    }

    fn registration_lost(&self) -> bool {
        self.registration_lost.load(Ordering::Acquire)
    }
}
