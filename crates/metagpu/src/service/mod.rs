//! Management gRPC API: process listing, streaming, kill, and ping.
//!
//! Each call is admitted once by the [`VisibilityAuthorizer`]; a stream keeps
//! the scope resolved at setup for its whole lifetime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use device_api::device::v1 as pb;
use device_api::DeviceService;
use futures::Stream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::info;
use tracing::warn;

use crate::allocation::AllocationTracker;
use crate::auth::auth_status;
use crate::auth::methods;
use crate::auth::CallerContext;
use crate::auth::VisibilityAuthorizer;
use crate::config::ConfigStore;
use crate::registry::DeviceProcess;
use crate::registry::ProcessRegistry;
use crate::registry::ProcessScope;

mod server;

pub use server::ManagementServer;
pub use server::ServerError;

impl From<DeviceProcess> for pb::DeviceProcess {
    fn from(process: DeviceProcess) -> Self {
        Self {
            uuid: process.device_uuid,
            pid: process.pid,
            memory: process.gpu_memory_bytes,
            cmdline: process.command_line,
            user: process.user,
            container_id: process.container_id,
            pod_name: process.pod_name,
            pod_namespace: process.pod_namespace,
            metagpu_requests: process.requested_metagpus,
            device_gpu_utilization: process.device_utilization_percent,
            device_memory_utilization: process.device_memory_utilization_percent,
        }
    }
}

/// Logs method and duration once the handler finishes.
async fn observed<T>(
    method: &'static str,
    call: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    let started = Instant::now();
    let result = call.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(method, elapsed_ms, "call completed"),
        Err(status) => info!(
            method,
            elapsed_ms,
            code = ?status.code(),
            "call rejected: {}",
            status.message()
        ),
    }
    result
}

#[derive(Clone)]
pub struct ManagementService {
    config: Arc<ConfigStore>,
    authorizer: Arc<VisibilityAuthorizer>,
    registry: Arc<ProcessRegistry>,
    tracker: Arc<AllocationTracker>,
    shutdown: CancellationToken,
}

impl ManagementService {
    pub fn new(
        config: Arc<ConfigStore>,
        authorizer: Arc<VisibilityAuthorizer>,
        registry: Arc<ProcessRegistry>,
        tracker: Arc<AllocationTracker>,
    ) -> Self {
        Self {
            config,
            authorizer,
            registry,
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open process streams end once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    fn admit<T>(&self, method: &'static str, request: &Request<T>) -> Result<CallerContext, Status> {
        self.authorizer
            .admit(method, request.metadata())
            .map_err(|e| auth_status(&e))
    }

    fn scope(caller: &CallerContext, pod_id: &str) -> Result<ProcessScope, Status> {
        caller.resolve_scope(pod_id).map_err(|e| auth_status(&e))
    }

    async fn scoped_processes(&self, scope: &ProcessScope) -> Vec<pb::DeviceProcess> {
        scoped_processes(&self.registry, scope).await
    }
}

async fn scoped_processes(registry: &ProcessRegistry, scope: &ProcessScope) -> Vec<pb::DeviceProcess> {
    registry
        .latest()
        .await
        .flatten(scope)
        .into_iter()
        .map(pb::DeviceProcess::from)
        .collect()
}

#[tonic::async_trait]
impl DeviceService for ManagementService {
    async fn list_device_processes(
        &self,
        request: Request<pb::ListDeviceProcessesRequest>,
    ) -> Result<Response<pb::ListDeviceProcessesResponse>, Status> {
        observed(methods::LIST_DEVICE_PROCESSES_NAME, async {
            let caller = self.admit(methods::LIST_DEVICE_PROCESSES_NAME, &request)?;
            let scope = Self::scope(&caller, &request.get_ref().pod_id)?;

            let devices_processes = self.scoped_processes(&scope).await;
            let summary = self.tracker.summary();
            Ok(Response::new(pb::ListDeviceProcessesResponse {
                devices_processes,
                total_metagpus: summary.total,
                allocated_metagpus: summary.allocated,
            }))
        })
        .await
    }

    type StreamDeviceProcessesStream =
        Pin<Box<dyn Stream<Item = Result<pb::StreamDeviceProcessesResponse, Status>> + Send>>;

    async fn stream_device_processes(
        &self,
        request: Request<pb::StreamDeviceProcessesRequest>,
    ) -> Result<Response<Self::StreamDeviceProcessesStream>, Status> {
        observed(methods::STREAM_DEVICE_PROCESSES_NAME, async {
            let caller = self.admit(methods::STREAM_DEVICE_PROCESSES_NAME, &request)?;
            let scope = Self::scope(&caller, &request.get_ref().pod_id)?;

            let registry = Arc::clone(&self.registry);
            let tracker = Arc::clone(&self.tracker);
            let period = self.config.current().stream_interval();
            let shutdown = self.shutdown.clone();

            // one frame per tick, a slow consumer skips ticks instead of queueing them
            let stream = async_stream::stream! {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => {
                            info!("management API stopping, ending process stream");
                            break;
                        }
                    }
                    let devices_processes = scoped_processes(&registry, &scope).await;
                    let summary = tracker.summary();
                    yield Ok(pb::StreamDeviceProcessesResponse {
                        devices_processes,
                        total_metagpus: summary.total,
                        allocated_metagpus: summary.allocated,
                    });
                }
            };
            Ok(Response::new(
                Box::pin(stream) as Self::StreamDeviceProcessesStream
            ))
        })
        .await
    }

    async fn kill_gpu_process(
        &self,
        request: Request<pb::KillGpuProcessRequest>,
    ) -> Result<Response<pb::KillGpuProcessResponse>, Status> {
        observed(methods::KILL_GPU_PROCESS_NAME, async {
            let caller = self.admit(methods::KILL_GPU_PROCESS_NAME, &request)?;
            let pb::KillGpuProcessRequest { pid, pod_id } = request.into_inner();

            let snapshot = self.registry.latest().await;
            caller
                .authorize_kill(pid, &pod_id, &snapshot)
                .map_err(|e| auth_status(&e))?;

            info!(pid, pod_id = %pod_id, "killing gpu process");
            self.registry.kill(pid).await.map_err(|e| {
                warn!(pid, "failed to kill gpu process: {e:?}");
                Status::internal(e.current_context().to_string())
            })?;
            Ok(Response::new(pb::KillGpuProcessResponse {}))
        })
        .await
    }

    async fn ping_server(
        &self,
        request: Request<pb::PingServerRequest>,
    ) -> Result<Response<pb::PingServerResponse>, Status> {
        observed(methods::PING_SERVER_NAME, async {
            self.admit(methods::PING_SERVER_NAME, &request)?;
            Ok(Response::new(pb::PingServerResponse {}))
        })
        .await
    }
}
