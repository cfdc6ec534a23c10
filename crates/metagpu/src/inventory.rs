use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::signal::RecalcSignal;
use crate::telemetry::PhysicalDevice;
use crate::telemetry::TelemetryError;
use crate::telemetry::TelemetryProvider;

/// Cached physical device inventory.
///
/// Readers never wait on the hardware: [`DeviceInventory::current`] returns
/// the last successfully queried set.
pub struct DeviceInventory {
    provider: Arc<dyn TelemetryProvider>,
    devices: RwLock<Arc<Vec<PhysicalDevice>>>,
}

impl DeviceInventory {
    pub fn new(provider: Arc<dyn TelemetryProvider>) -> Self {
        Self {
            provider,
            devices: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub async fn current(&self) -> Arc<Vec<PhysicalDevice>> {
        self.devices.read().await.clone()
    }

    /// Queries the provider and swaps in the result, returns whether it changed.
    pub async fn refresh(&self) -> Result<bool, Report<TelemetryError>> {
        let provider = Arc::clone(&self.provider);
        let mut devices = tokio::task::spawn_blocking(move || provider.list_devices())
            .await
            .map_err(|e| {
                Report::new(TelemetryError::DeviceQuery {
                    message: format!("inventory query task failed: {e}"),
                })
            })??;
        devices.sort();

        let mut current = self.devices.write().await;
        if **current == devices {
            return Ok(false);
        }
        info!(
            devices = devices.len(),
            healthy = devices.iter().filter(|d| d.healthy).count(),
            "device inventory changed"
        );
        *current = Arc::new(devices);
        Ok(true)
    }

    /// Refreshes every `interval` until cancelled.
    ///
    /// A changed inventory triggers `signal`; a provider error stops the loop
    /// and is returned to the caller.
    #[tracing::instrument(skip_all, fields(interval = ?interval))]
    pub async fn run(
        &self,
        interval: Duration,
        signal: Arc<RecalcSignal>,
        token: CancellationToken,
    ) -> Result<(), Report<TelemetryError>> {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("device inventory poller shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match self.refresh().await {
                Ok(true) => signal.trigger(),
                Ok(false) => debug!("device inventory unchanged"),
                Err(e) => {
                    error!("device inventory refresh failed: {e:?}");
                    return Err(e);
                }
            }
        }
    }
}
