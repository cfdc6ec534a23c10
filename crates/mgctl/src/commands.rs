use anyhow::Context;
use anyhow::Result;
use api_types::token;
use api_types::VisibilityClaims;
use api_types::VisibilityLevel;
use device_api::device::v1::KillGpuProcessRequest;
use device_api::device::v1::ListDeviceProcessesRequest;
use device_api::device::v1::PingServerRequest;
use device_api::device::v1::StreamDeviceProcessesRequest;
use futures::StreamExt;

use crate::client::ManagementClient;
use crate::output::render_processes;

pub async fn list_processes(client: &mut ManagementClient, pod_id: Option<String>) -> Result<()> {
    let response = client
        .list_device_processes(ListDeviceProcessesRequest {
            pod_id: pod_id.unwrap_or_default(),
        })
        .await
        .context("Failed to list device processes")?
        .into_inner();

    println!(
        "{}",
        render_processes(
            &response.devices_processes,
            response.total_metagpus,
            response.allocated_metagpus
        )
    );
    Ok(())
}

/// Redraws the table on every frame until the server ends the stream.
pub async fn watch_processes(client: &mut ManagementClient, pod_id: Option<String>) -> Result<()> {
    let mut frames = client
        .stream_device_processes(StreamDeviceProcessesRequest {
            pod_id: pod_id.unwrap_or_default(),
        })
        .await
        .context("Failed to open process stream")?
        .into_inner();

    while let Some(frame) = frames.next().await {
        let frame = frame.context("Process stream failed")?;
        // clear screen, cursor home
        print!("\x1b[2J\x1b[H");
        println!(
            "{}",
            render_processes(
                &frame.devices_processes,
                frame.total_metagpus,
                frame.allocated_metagpus
            )
        );
    }
    Ok(())
}

pub async fn kill_process(
    client: &mut ManagementClient,
    pid: u32,
    pod_id: Option<String>,
) -> Result<()> {
    client
        .kill_gpu_process(KillGpuProcessRequest {
            pid,
            pod_id: pod_id.unwrap_or_default(),
        })
        .await
        .with_context(|| format!("Failed to kill process {pid}"))?;
    println!("process {pid} killed");
    Ok(())
}

pub async fn ping(client: &mut ManagementClient) -> Result<()> {
    client
        .ping_server(PingServerRequest {})
        .await
        .context("Management API did not answer")?;
    println!("pong");
    Ok(())
}

pub fn create_token(
    level: VisibilityLevel,
    pod_id: Option<String>,
    subject: Option<String>,
    ttl_secs: Option<u64>,
    secret: &str,
) -> Result<String> {
    let mut claims = VisibilityClaims::new(level);
    claims.pod_id = pod_id;
    claims.sub = subject;
    claims.exp = ttl_secs.map(|ttl| chrono::Utc::now().timestamp().unsigned_abs() + ttl);

    token::sign(&claims, secret.as_bytes()).context("Failed to sign token")
}
