use error_stack::Report;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Device;
use nvml_wrapper::Nvml;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::kill_process;
use super::DeviceProcessReport;
use super::PhysicalDevice;
use super::RawProcess;
use super::TelemetryError;
use super::TelemetryProvider;

/// Telemetry provider backed by the NVIDIA management library.
pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self, Report<TelemetryError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                info!("NVML initialized successfully");
                nvml
            }
            Err(e) => {
                warn!("Standard NVML init failed ({e}), trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .map_err(|e| {
                        Report::new(TelemetryError::Init {
                            message: e.to_string(),
                        })
                    })?;
                info!("NVML initialized with explicit library path");
                nvml
            }
        };
        Ok(Self { nvml })
    }

    fn device_by_id(&self, device_id: &str) -> Result<Device<'_>, Report<TelemetryError>> {
        self.nvml.device_by_uuid(device_id).map_err(|e| {
            Report::new(TelemetryError::ProcessQuery {
                device: device_id.to_string(),
                message: e.to_string(),
            })
        })
    }
}

impl TelemetryProvider for NvmlTelemetry {
    fn list_devices(&self) -> Result<Vec<PhysicalDevice>, Report<TelemetryError>> {
        let query_error =
            |e: nvml_wrapper::error::NvmlError| TelemetryError::DeviceQuery { message: e.to_string() };

        let count = self.nvml.device_count().map_err(query_error)?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self.nvml.device_by_index(index).map_err(query_error)?;
            let id = device.uuid().map_err(query_error)?;
            let healthy = match device.memory_info() {
                Ok(_) => true,
                Err(e) => {
                    warn!(device = %id, "device failed health check: {e}");
                    false
                }
            };
            debug!(index, device = %id, healthy, "discovered device");
            devices.push(PhysicalDevice { id, healthy });
        }
        Ok(devices)
    }

    fn list_processes(
        &self,
        device_id: &str,
    ) -> Result<DeviceProcessReport, Report<TelemetryError>> {
        let process_error = |e: nvml_wrapper::error::NvmlError| TelemetryError::ProcessQuery {
            device: device_id.to_string(),
            message: e.to_string(),
        };

        let device = self.device_by_id(device_id)?;
        let utilization = device.utilization_rates().map_err(process_error)?;
        let processes = device
            .running_compute_processes()
            .map_err(process_error)?
            .into_iter()
            .map(|info| RawProcess {
                pid: info.pid,
                gpu_memory_bytes: match info.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();

        Ok(DeviceProcessReport {
            gpu_utilization_percent: utilization.gpu,
            memory_utilization_percent: utilization.memory,
            processes,
        })
    }

    fn terminate(&self, pid: u32) -> Result<(), Report<TelemetryError>> {
        kill_process(pid)
    }
}
