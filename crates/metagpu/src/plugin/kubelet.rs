use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use device_api::deviceplugin::v1beta1::device_plugin_server::DevicePlugin;
use device_api::deviceplugin::v1beta1::device_plugin_server::DevicePluginServer;
use device_api::deviceplugin::v1beta1::registration_client::RegistrationClient;
use device_api::deviceplugin::v1beta1::AllocateRequest;
use device_api::deviceplugin::v1beta1::AllocateResponse;
use device_api::deviceplugin::v1beta1::ContainerAllocateResponse;
use device_api::deviceplugin::v1beta1::Device;
use device_api::deviceplugin::v1beta1::DevicePluginOptions;
use device_api::deviceplugin::v1beta1::Empty;
use device_api::deviceplugin::v1beta1::ListAndWatchResponse;
use device_api::deviceplugin::v1beta1::PreStartContainerRequest;
use device_api::deviceplugin::v1beta1::PreStartContainerResponse;
use device_api::deviceplugin::v1beta1::PreferredAllocationRequest;
use device_api::deviceplugin::v1beta1::PreferredAllocationResponse;
use device_api::deviceplugin::v1beta1::RegisterRequest;
use error_stack::Report;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::registrar::RegistrarError;
use super::registrar::ResourceRegistrar;
use crate::topology::MetaGpuUnit;
use crate::uds::connect_unix;

pub const PLUGIN_SOCKET: &str = "metagpu.sock";
pub const KUBELET_SOCKET: &str = "kubelet.sock";
const API_VERSION: &str = "v1beta1";
const HEALTHY: &str = "Healthy";

pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";
pub const METAGPU_UNITS_ENV: &str = "METAGPU_UNITS";

type Units = Arc<Vec<MetaGpuUnit>>;

struct ServingPlugin {
    socket_path: PathBuf,
    token: CancellationToken,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServingPlugin {
    async fn shutdown(self) {
        self.token.cancel();
        match self.handle.await {
            Ok(Ok(())) => debug!("device plugin server stopped"),
            Ok(Err(e)) => warn!("device plugin server ended with error: {e}"),
            Err(e) => error!("device plugin server task failed: {e}"),
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), "failed to remove plugin socket: {e}");
            }
        }
    }
}

/// Advertises metagpu units through the kubelet device plugin API.
///
/// The first advertisement starts the plugin's gRPC server on
/// `<plugin_dir>/metagpu.sock` and registers it; later ones only replace the
/// unit list streamed to the kubelet.
pub struct KubeletRegistrar {
    plugin_dir: PathBuf,
    resource_name: String,
    units: watch::Sender<Units>,
    serving: Mutex<Option<ServingPlugin>>,
}

impl KubeletRegistrar {
    pub fn new(plugin_dir: PathBuf, resource_name: String) -> Self {
        let (units, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            plugin_dir,
            resource_name,
            units,
            serving: Mutex::new(None),
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(PLUGIN_SOCKET)
    }

    fn serve(&self) -> Result<ServingPlugin, Report<RegistrarError>> {
        let socket_path = self.socket_path();
        let serve_error = |message: String| Report::new(RegistrarError::Serve { message });

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                serve_error(format!("failed to remove stale socket {}: {e}", socket_path.display()))
            })?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| serve_error(format!("failed to bind {}: {e}", socket_path.display())))?;

        let token = CancellationToken::new();
        let service = DevicePluginService {
            units: self.units.subscribe(),
            token: token.clone(),
        };
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                })
                .await
        });
        info!(socket = %socket_path.display(), "device plugin server listening");

        Ok(ServingPlugin {
            socket_path,
            token,
            handle,
        })
    }

    async fn register(&self) -> Result<(), Report<RegistrarError>> {
        let kubelet_socket = self.plugin_dir.join(KUBELET_SOCKET);
        let register_error = |message: String| Report::new(RegistrarError::Register { message });

        let channel = connect_unix(&kubelet_socket).await.map_err(|e| {
            register_error(format!("failed to connect to {}: {e}", kubelet_socket.display()))
        })?;
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: PLUGIN_SOCKET.to_string(),
            resource_name: self.resource_name.clone(),
            options: Some(DevicePluginOptions::default()),
        };
        RegistrationClient::new(channel)
            .register(Request::new(request))
            .await
            .map_err(|e| register_error(e.to_string()))?;

        info!(resource_name = %self.resource_name, "registered device plugin with kubelet");
        Ok(())
    }
}

#[async_trait]
impl ResourceRegistrar for KubeletRegistrar {
    async fn advertise(&self, units: &[MetaGpuUnit]) -> Result<(), Report<RegistrarError>> {
        self.units.send_replace(Arc::new(units.to_vec()));

        let mut serving = self.serving.lock().await;
        // a kubelet restart wipes the plugin directory, serve and register again
        let socket_gone = serving
            .as_ref()
            .is_some_and(|plugin| !plugin.socket_path.exists());
        if socket_gone {
            warn!("plugin socket disappeared, re-registering with kubelet");
            if let Some(plugin) = serving.take() {
                plugin.shutdown().await;
            }
        }

        if serving.is_none() {
            let plugin = self.serve()?;
            if let Err(e) = self.register().await {
                plugin.shutdown().await;
                return Err(e);
            }
            *serving = Some(plugin);
        }

        info!(units = units.len(), "advertised metagpu capacity");
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), Report<RegistrarError>> {
        if let Some(plugin) = self.serving.lock().await.take() {
            info!("withdrawing device plugin");
            plugin.shutdown().await;
        }
        Ok(())
    }

    fn registration_lost(&self) -> bool {
        // a held lock means an advertisement is in flight
        self.serving.try_lock().is_ok_and(|serving| {
            serving
                .as_ref()
                .is_some_and(|plugin| !plugin.socket_path.exists())
        })
    }
}

/// Kubelet facing DevicePlugin service.
struct DevicePluginService {
    units: watch::Receiver<Units>,
    token: CancellationToken,
}

fn to_devices(units: &[MetaGpuUnit]) -> Vec<Device> {
    units
        .iter()
        .map(|unit| Device {
            id: unit.id.clone(),
            health: HEALTHY.to_string(),
            topology: None,
        })
        .collect()
}

/// Environment handed to a container requesting `requested` units.
pub fn container_allocation(
    units: &[MetaGpuUnit],
    requested: &[String],
) -> Result<ContainerAllocateResponse, Status> {
    let by_id: HashMap<&str, &MetaGpuUnit> =
        units.iter().map(|unit| (unit.id.as_str(), unit)).collect();

    let mut parents = BTreeSet::new();
    for id in requested {
        let unit = by_id
            .get(id.as_str())
            .ok_or_else(|| Status::invalid_argument(format!("unknown metagpu unit {id}")))?;
        parents.insert(unit.parent_device_id.as_str());
    }

    let envs = HashMap::from([
        (
            VISIBLE_DEVICES_ENV.to_string(),
            parents.into_iter().collect::<Vec<_>>().join(","),
        ),
        (METAGPU_UNITS_ENV.to_string(), requested.len().to_string()),
    ]);

    Ok(ContainerAllocateResponse {
        envs,
        ..Default::default()
    })
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("kubelet started watching metagpu units");
        let mut units = self.units.clone();
        let token = self.token.clone();

        let stream = async_stream::stream! {
            loop {
                let current = units.borrow_and_update().clone();
                debug!(units = current.len(), "sending metagpu units to kubelet");
                yield Ok(ListAndWatchResponse { devices: to_devices(&current) });
                tokio::select! {
                    changed = units.changed() => {
                        if changed.is_err() {
                            debug!("unit publisher dropped, ending ListAndWatch");
                            break;
                        }
                    }
                    _ = token.cancelled() => {
                        info!("device plugin stopping, ending ListAndWatch");
                        break;
                    }
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        let units = self.units.borrow().clone();

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                info!(units = ?container.devices_ids, "allocating metagpu units");
                container_allocation(&units, &container.devices_ids)
            })
            .collect::<Result<Vec<_>, Status>>()?;

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use device_api::deviceplugin::v1beta1::device_plugin_client::DevicePluginClient;
    use device_api::deviceplugin::v1beta1::registration_server::Registration;
    use device_api::deviceplugin::v1beta1::registration_server::RegistrationServer;
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use tonic::Code;

    use super::*;
    use crate::telemetry::PhysicalDevice;
    use crate::topology::derive;

    fn units(ids: &[&str], fraction: u32) -> Vec<MetaGpuUnit> {
        let devices: Vec<PhysicalDevice> = ids
            .iter()
            .map(|id| PhysicalDevice {
                id: id.to_string(),
                healthy: true,
            })
            .collect();
        derive(&devices, fraction)
    }

    #[test]
    fn allocation_exports_sorted_unique_parents() {
        let units = units(&["GPU-b", "GPU-a"], 2);
        let requested = vec![
            "GPU-b-1".to_string(),
            "GPU-a-0".to_string(),
            "GPU-b-0".to_string(),
        ];

        let response = container_allocation(&units, &requested).expect("known units");

        assert_eq!(
            response.envs.get(VISIBLE_DEVICES_ENV).map(String::as_str),
            Some("GPU-a,GPU-b")
        );
        assert_eq!(
            response.envs.get(METAGPU_UNITS_ENV).map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn allocation_rejects_unknown_unit() {
        let units = units(&["GPU-a"], 2);

        let status = container_allocation(&units, &["GPU-a-7".to_string()])
            .expect_err("unit does not exist");

        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[derive(Clone, Default)]
    struct FakeKubelet {
        requests: Arc<std::sync::Mutex<Vec<RegisterRequest>>>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> TonicResult<Response<Empty>> {
            self.requests
                .lock()
                .expect("lock")
                .push(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    /// Fake kubelet listening on `<dir>/kubelet.sock`.
    fn spawn_kubelet(dir: &std::path::Path) -> (FakeKubelet, CancellationToken) {
        let kubelet = FakeKubelet::default();
        let listener = UnixListener::bind(dir.join(KUBELET_SOCKET)).expect("bind kubelet");
        let token = CancellationToken::new();
        {
            let kubelet = kubelet.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(RegistrationServer::new(kubelet))
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                        token.cancelled().await
                    })
                    .await
            });
        }
        (kubelet, token)
    }

    #[tokio::test]
    async fn advertise_registers_and_streams_units() {
        // Arrange
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (kubelet, kubelet_token) = spawn_kubelet(dir.path());
        let registrar = KubeletRegistrar::new(dir.path().to_path_buf(), "cnvrg.io/metagpu".into());

        // Act
        registrar
            .advertise(&units(&["GPU-a"], 4))
            .await
            .expect("first advertise should register");
        let channel = connect_unix(&dir.path().join(PLUGIN_SOCKET))
            .await
            .expect("plugin socket should accept connections");
        let mut stream = DevicePluginClient::new(channel)
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("list and watch")
            .into_inner();
        let first = stream.next().await.expect("first frame").expect("ok frame");
        registrar
            .advertise(&units(&["GPU-a"], 2))
            .await
            .expect("second advertise");
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("second frame in time")
            .expect("stream open")
            .expect("ok frame");
        tokio::time::timeout(Duration::from_secs(5), registrar.withdraw())
            .await
            .expect("withdraw completes while the kubelet is still watching")
            .expect("withdraw");
        let after_withdraw = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("watch ends with the server");

        // Assert
        let requests = kubelet.requests.lock().expect("lock").clone();
        assert_eq!(requests.len(), 1, "registration happens once");
        assert_eq!(requests[0].endpoint, PLUGIN_SOCKET);
        assert_eq!(requests[0].resource_name, "cnvrg.io/metagpu");
        assert_eq!(first.devices.len(), 4);
        assert_eq!(second.devices.len(), 2);
        assert!(second.devices.iter().all(|d| d.health == HEALTHY));
        assert!(
            !matches!(after_withdraw, Some(Ok(_))),
            "no frames after withdraw"
        );
        assert!(
            !dir.path().join(PLUGIN_SOCKET).exists(),
            "withdraw removes the plugin socket"
        );
        kubelet_token.cancel();
    }

    #[tokio::test]
    async fn advertise_fails_without_kubelet() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let registrar = KubeletRegistrar::new(dir.path().to_path_buf(), "cnvrg.io/metagpu".into());

        let result = registrar.advertise(&units(&["GPU-a"], 1)).await;

        let err = result.expect_err("no kubelet to register with");
        assert!(matches!(
            err.current_context(),
            RegistrarError::Register { .. }
        ));
        assert!(!dir.path().join(PLUGIN_SOCKET).exists());
    }

    #[tokio::test]
    async fn vanished_socket_is_reported_and_registered_again() {
        // Arrange
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (kubelet, kubelet_token) = spawn_kubelet(dir.path());
        let registrar = KubeletRegistrar::new(dir.path().to_path_buf(), "cnvrg.io/metagpu".into());
        registrar
            .advertise(&units(&["GPU-a"], 2))
            .await
            .expect("first advertise should register");
        assert!(!registrar.registration_lost(), "fresh registration is live");

        // Act: a kubelet restart wipes the plugin directory
        std::fs::remove_file(dir.path().join(PLUGIN_SOCKET)).expect("remove plugin socket");
        let lost = registrar.registration_lost();
        registrar
            .advertise(&units(&["GPU-a"], 2))
            .await
            .expect("same units are advertised again");

        // Assert
        assert!(lost, "missing socket is detected");
        assert!(!registrar.registration_lost());
        assert!(dir.path().join(PLUGIN_SOCKET).exists(), "socket is served again");
        assert_eq!(kubelet.requests.lock().expect("lock").len(), 2);
        registrar.withdraw().await.expect("withdraw");
        kubelet_token.cancel();
    }
}
