use api_types::free_percent;
use device_api::DeviceProcess;
use tabled::builder::Builder;
use tabled::settings::Style;

const MIB: u64 = 1024 * 1024;

pub fn render_processes(processes: &[DeviceProcess], total: u32, allocated: u32) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "Device UUID",
        "Pid",
        "GpuMemory (MiB)",
        "Command",
        "Pod",
        "Namespace",
        "Metagpus",
    ]);

    for process in processes {
        builder.push_record([
            process.uuid.clone(),
            process.pid.to_string(),
            (process.memory / MIB).to_string(),
            process.cmdline.clone(),
            process.pod_name.clone(),
            process.pod_namespace.clone(),
            process.metagpu_requests.to_string(),
        ]);
    }

    let table = builder.build().with(Style::rounded()).to_string();
    format!(
        "{table}\nFree: {}%  Total: {total}",
        free_percent(total, allocated)
    )
}
