//! Accelerator and host process facts.
//!
//! [`TelemetryProvider`] is the hardware side (device inventory, per device
//! compute processes, process termination), [`ProcessInspector`] supplies
//! what the host knows about a pid.

use core::error::Error;

use error_stack::Report;

pub mod nvml;
pub mod procfs;

pub use nvml::NvmlTelemetry;
pub use procfs::ProcfsInspector;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalDevice {
    pub id: String,
    pub healthy: bool,
}

/// Compute process as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub gpu_memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProcessReport {
    pub gpu_utilization_percent: u32,
    pub memory_utilization_percent: u32,
    pub processes: Vec<RawProcess>,
}

#[derive(Debug, derive_more::Display)]
pub enum TelemetryError {
    #[display("Failed to initialize NVML: {message}")]
    Init { message: String },
    #[display("Failed to query device inventory: {message}")]
    DeviceQuery { message: String },
    #[display("Failed to list processes on device {device}: {message}")]
    ProcessQuery { device: String, message: String },
    #[display("Failed to terminate process {pid}: {message}")]
    Terminate { pid: u32, message: String },
}

impl Error for TelemetryError {}

pub trait TelemetryProvider: Send + Sync {
    /// Errors here are fatal to the caller.
    fn list_devices(&self) -> Result<Vec<PhysicalDevice>, Report<TelemetryError>>;

    fn list_processes(
        &self,
        device_id: &str,
    ) -> Result<DeviceProcessReport, Report<TelemetryError>>;

    fn terminate(&self, pid: u32) -> Result<(), Report<TelemetryError>>;
}

/// Host view of a process, every field is best effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDetails {
    pub user: String,
    pub short_cmdline: String,
    pub container_id: Option<String>,
}

pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, pid: u32) -> ProcessDetails;
}

/// Sends `SIGKILL` to `pid`.
pub fn kill_process(pid: u32) -> Result<(), Report<TelemetryError>> {
    let terminate_error = |message: String| Report::new(TelemetryError::Terminate { pid, message });

    // pid 0 and negative values address process groups
    let target = libc::pid_t::try_from(pid)
        .ok()
        .filter(|target| *target > 0)
        .ok_or_else(|| terminate_error("pid is not a single process".to_string()))?;

    // SAFETY: kill(2) takes plain integers and touches no memory we own
    let ret = unsafe { libc::kill(target, libc::SIGKILL) };
    if ret != 0 {
        return Err(terminate_error(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}
