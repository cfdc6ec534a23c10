use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;
use tracing::info;

use crate::topology::MetaGpuUnit;

#[derive(Debug, derive_more::Display)]
pub enum RegistrarError {
    #[display("Failed to serve the device plugin: {message}")]
    Serve { message: String },
    #[display("Failed to register with the kubelet: {message}")]
    Register { message: String },
}

impl Error for RegistrarError {}

/// Capacity advertisement towards the node's resource plugin framework.
#[async_trait]
pub trait ResourceRegistrar: Send + Sync {
    /// Publishes `units` as the node's schedulable capacity, replacing any previous set.
    async fn advertise(&self, units: &[MetaGpuUnit]) -> Result<(), Report<RegistrarError>>;

    async fn withdraw(&self) -> Result<(), Report<RegistrarError>>;

    /// True once a previous advertisement is no longer seen by the node, e.g.
    /// after a kubelet restart. The next advertisement restores it.
    fn registration_lost(&self) -> bool {
        false
    }
}

/// Registrar used when the kubelet integration is disabled, only logs capacity.
#[derive(Debug, Default)]
pub struct StandaloneRegistrar;

#[async_trait]
impl ResourceRegistrar for StandaloneRegistrar {
    async fn advertise(&self, units: &[MetaGpuUnit]) -> Result<(), Report<RegistrarError>> {
        info!(units = units.len(), "metagpu capacity (kubelet integration disabled)");
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), Report<RegistrarError>> {
        Ok(())
    }
}
