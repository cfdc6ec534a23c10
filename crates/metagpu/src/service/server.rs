use core::error::Error;
use std::net::SocketAddr;

use device_api::DeviceServiceServer;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ManagementService;

#[derive(Debug, derive_more::Display)]
pub enum ServerError {
    #[display("Management API on {addr} failed: {message}")]
    Transport { addr: SocketAddr, message: String },
}

impl Error for ServerError {}

/// TCP listener for the management API.
pub struct ManagementServer {
    addr: SocketAddr,
    service: ManagementService,
}

impl ManagementServer {
    pub fn new(addr: SocketAddr, service: ManagementService) -> Self {
        Self { addr, service }
    }

    /// Serves until `token` is cancelled; open process streams are closed first.
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ServerError>> {
        let addr = self.addr;
        info!(%addr, "management API listening");

        tonic::transport::Server::builder()
            .add_service(DeviceServiceServer::new(
                self.service.with_shutdown(token.clone()),
            ))
            .serve_with_shutdown(addr, async move {
                token.cancelled().await;
                info!("management API shutdown requested");
            })
            .await
            .map_err(|e| {
                Report::new(ServerError::Transport {
                    addr,
                    message: e.to_string(),
                })
            })
    }
}
