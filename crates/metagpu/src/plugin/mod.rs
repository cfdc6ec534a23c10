//! Plugin lifecycle: owns the recalculation listener and republishes the
//! metagpu topology to the registrar.

use core::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::allocation::AllocationTracker;
use crate::config::ConfigStore;
use crate::inventory::DeviceInventory;
use crate::signal::RecalcSignal;
use crate::topology;
use crate::topology::Topology;
use crate::topology::TopologyStore;

pub mod kubelet;
mod registrar;

pub use kubelet::KubeletRegistrar;
pub use registrar::RegistrarError;
pub use registrar::ResourceRegistrar;
pub use registrar::StandaloneRegistrar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Plugin is {actual}, expected {expected}")]
    InvalidState {
        expected: PluginState,
        actual: PluginState,
    },
    #[display("Device inventory failed")]
    Inventory,
    #[display("Failed to advertise metagpu capacity")]
    Advertise,
    #[display("Failed to withdraw metagpu capacity")]
    Withdraw,
}

impl Error for PluginError {}

const REGISTRATION_CHECK_PERIOD: Duration = Duration::from_secs(5);

pub type PluginTask = JoinHandle<Result<(), Report<PluginError>>>;

/// Drives inventory polling and topology recomputation for one node.
pub struct MetaGpuPlugin {
    config: Arc<ConfigStore>,
    inventory: Arc<DeviceInventory>,
    topology: Arc<TopologyStore>,
    tracker: Arc<AllocationTracker>,
    registrar: Arc<dyn ResourceRegistrar>,
    signal: Arc<RecalcSignal>,
    state: Mutex<PluginState>,
    token: Mutex<CancellationToken>,
    recompute_lock: tokio::sync::Mutex<()>,
    advertise_pending: AtomicBool,
    recomputes: AtomicU64,
}

impl MetaGpuPlugin {
    pub fn new(
        config: Arc<ConfigStore>,
        inventory: Arc<DeviceInventory>,
        topology: Arc<TopologyStore>,
        tracker: Arc<AllocationTracker>,
        registrar: Arc<dyn ResourceRegistrar>,
        signal: Arc<RecalcSignal>,
    ) -> Self {
        Self {
            config,
            inventory,
            topology,
            tracker,
            registrar,
            signal,
            state: Mutex::new(PluginState::Stopped),
            token: Mutex::new(CancellationToken::new()),
            recompute_lock: tokio::sync::Mutex::new(()),
            advertise_pending: AtomicBool::new(false),
            recomputes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of recomputations performed so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Acquire)
    }

    fn transition(&self, from: PluginState, to: PluginState) -> Result<(), Report<PluginError>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(Report::new(PluginError::InvalidState {
                expected: from,
                actual: *state,
            }));
        }
        debug!(from = %from, to = %to, "plugin state transition");
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: PluginState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    /// Loads the inventory, advertises the first topology and spawns the
    /// background loops.
    ///
    /// The returned task ends when the plugin is stopped, or with an error
    /// when the device inventory can no longer be read.
    pub async fn start(self: &Arc<Self>) -> Result<PluginTask, Report<PluginError>> {
        self.transition(PluginState::Stopped, PluginState::Starting)?;

        let initial = async {
            self.inventory
                .refresh()
                .await
                .change_context(PluginError::Inventory)?;
            self.recompute().await
        };
        if let Err(e) = initial.await {
            self.set_state(PluginState::Stopped);
            return Err(e);
        }

        let token = CancellationToken::new();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.transition(PluginState::Starting, PluginState::Running)?;

        let plugin = Arc::clone(self);
        let task = tokio::spawn(async move { plugin.run_loops(token).await });
        info!("metagpu plugin running");
        Ok(task)
    }

    async fn run_loops(&self, token: CancellationToken) -> Result<(), Report<PluginError>> {
        let interval = self.config.current().device_cache_ttl();
        tokio::select! {
            result = self.inventory.run(interval, Arc::clone(&self.signal), token.clone()) => {
                result.change_context(PluginError::Inventory)
            }
            () = self.listen(token.clone()) => Ok(()),
            () = self.watch_registration(token.clone()) => Ok(()),
        }
    }

    /// Schedules a re-advertisement when the registrar lost its registration,
    /// even though the topology did not change.
    async fn watch_registration(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(REGISTRATION_CHECK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.registrar.registration_lost() {
                warn!("metagpu registration lost, scheduling re-advertisement");
                self.advertise_pending.store(true, Ordering::Release);
                self.signal.trigger();
            }
        }
    }

    /// Recomputes once per burst of signals.
    #[tracing::instrument(skip_all)]
    async fn listen(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("recalculation listener shutdown requested");
                    return;
                }
                _ = self.signal.notified() => {}
            }

            while self.signal.take_pending() {
                if let Err(e) = self.recompute().await {
                    warn!("topology recomputation failed: {e:?}");
                }
            }
        }
    }

    /// Derives the topology from the cached inventory and the configured
    /// fraction, and advertises it when it changed.
    ///
    /// Recomputations are serialized. Returns the advertised topology, or
    /// `None` when nothing changed.
    pub async fn recompute(&self) -> Result<Option<Arc<Topology>>, Report<PluginError>> {
        let _serial = self.recompute_lock.lock().await;
        self.recomputes.fetch_add(1, Ordering::AcqRel);

        let fraction = self.config.current().meta_gpus_per_device;
        let devices = self.inventory.current().await;
        let units = topology::derive(&devices, fraction);

        let topology = match self.topology.replace(fraction, units).await {
            Some(topology) => {
                info!(
                    generation = topology.generation(),
                    fraction,
                    devices = devices.len(),
                    units = topology.len(),
                    "metagpu topology recomputed"
                );
                self.tracker.set_units(topology.unit_ids());
                topology
            }
            None if self.advertise_pending.load(Ordering::Acquire) => {
                self.topology.current().await
            }
            None => {
                debug!("metagpu topology unchanged");
                return Ok(None);
            }
        };

        if let Err(e) = self.registrar.advertise(topology.units()).await {
            self.advertise_pending.store(true, Ordering::Release);
            return Err(e.change_context(PluginError::Advertise));
        }
        self.advertise_pending.store(false, Ordering::Release);
        Ok(Some(topology))
    }

    /// Withdraws from the registrar and halts the background loops.
    ///
    /// Calling it again, or before [`MetaGpuPlugin::start`], does nothing.
    pub async fn stop(&self) -> Result<(), Report<PluginError>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PluginState::Stopped | PluginState::Stopping => {
                    debug!(state = %*state, "plugin not running, nothing to stop");
                    return Ok(());
                }
                PluginState::Starting | PluginState::Running => *state = PluginState::Stopping,
            }
        }

        info!("stopping metagpu plugin");
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        let withdrawn = self
            .registrar
            .withdraw()
            .await
            .change_context(PluginError::Withdraw);
        self.set_state(PluginState::Stopped);
        withdrawn
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::config::MetaGpuConfig;
    use crate::testing::MockTelemetry;
    use crate::testing::RecordingRegistrar;

    struct Fixture {
        config: Arc<ConfigStore>,
        provider: Arc<MockTelemetry>,
        registrar: Arc<RecordingRegistrar>,
        signal: Arc<RecalcSignal>,
        topology: Arc<TopologyStore>,
        tracker: Arc<AllocationTracker>,
        plugin: Arc<MetaGpuPlugin>,
    }

    fn config_with_fraction(fraction: u32) -> MetaGpuConfig {
        MetaGpuConfig {
            meta_gpus_per_device: fraction,
            jwt_secret: "secret".to_string(),
            ..MetaGpuConfig::default()
        }
    }

    fn fixture(devices: &[&str], fraction: u32) -> Fixture {
        let config = Arc::new(ConfigStore::new("config.yaml", config_with_fraction(fraction)));
        let provider = Arc::new(MockTelemetry::with_devices(devices));
        let registrar = Arc::new(RecordingRegistrar::default());
        let signal = Arc::new(RecalcSignal::new());
        let topology = Arc::new(TopologyStore::new());
        let tracker = Arc::new(AllocationTracker::new());
        let plugin = Arc::new(MetaGpuPlugin::new(
            config.clone(),
            Arc::new(DeviceInventory::new(provider.clone())),
            topology.clone(),
            tracker.clone(),
            registrar.clone(),
            signal.clone(),
        ));
        Fixture {
            config,
            provider,
            registrar,
            signal,
            topology,
            tracker,
            plugin,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should be reached in time");
    }

    #[test(tokio::test)]
    async fn fraction_change_readvertises_smaller_capacity() {
        // Arrange
        let f = fixture(&["gpu-0", "gpu-1"], 4);
        let task = f.plugin.start().await.expect("plugin should start");
        let initial_ids = f.topology.current().await.unit_ids();

        // Act
        f.config.replace(config_with_fraction(2));
        f.signal.trigger();
        wait_until(|| f.registrar.advertised().len() == 2).await;
        f.plugin.stop().await.expect("stop");

        // Assert
        assert_eq!(
            initial_ids,
            vec![
                "gpu-0-0", "gpu-0-1", "gpu-0-2", "gpu-0-3", "gpu-1-0", "gpu-1-1", "gpu-1-2",
                "gpu-1-3"
            ]
        );
        assert_eq!(f.registrar.advertised(), vec![8, 4], "capacity drops from 8 to 4");
        assert_eq!(f.topology.current().await.len(), 4);
        assert_eq!(f.tracker.summary().total, 4, "tracker follows the topology");
        assert!(task.await.expect("join").is_ok());
    }

    #[test(tokio::test)]
    async fn signal_during_recompute_schedules_one_follow_up() {
        // Arrange
        let f = fixture(&["gpu-0", "gpu-1"], 2);
        let task = f.plugin.start().await.expect("plugin should start");
        f.registrar.close_gate();
        f.config.replace(config_with_fraction(4));
        f.signal.trigger();
        wait_until(|| f.registrar.arrivals() == 2).await;

        // Act: burst while the first recompute is blocked in advertise
        f.config.replace(config_with_fraction(1));
        f.signal.trigger();
        f.signal.trigger();
        f.signal.trigger();
        f.registrar.open_gate();
        wait_until(|| f.registrar.advertised().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert
        assert_eq!(f.registrar.advertised(), vec![4, 8, 2], "final state is not dropped");
        assert_eq!(
            f.plugin.recompute_count(),
            3,
            "initial, signalled, and exactly one follow-up"
        );
        f.plugin.stop().await.expect("stop");
        assert!(task.await.expect("join").is_ok());
    }

    #[test(tokio::test)]
    async fn unchanged_inputs_do_not_readvertise() {
        let f = fixture(&["gpu-0"], 2);
        f.plugin.start().await.expect("plugin should start");

        let again = f.plugin.recompute().await.expect("recompute");

        assert!(again.is_none(), "identical inputs are a no-op");
        assert_eq!(f.registrar.advertised(), vec![2]);
        assert_eq!(f.topology.current().await.generation(), 1);
        f.plugin.stop().await.expect("stop");
    }

    #[test(tokio::test)]
    async fn failed_advertisement_is_retried_on_next_recompute() {
        let f = fixture(&["gpu-0"], 2);
        f.plugin.start().await.expect("plugin should start");
        f.config.replace(config_with_fraction(3));
        f.registrar.fail_advertise(true);

        let failed = f.plugin.recompute().await;
        f.registrar.fail_advertise(false);
        let retried = f.plugin.recompute().await.expect("retry");

        assert!(failed.is_err());
        assert_eq!(retried.map(|t| t.len()), Some(3));
        assert_eq!(f.registrar.advertised(), vec![2, 3]);
        f.plugin.stop().await.expect("stop");
    }

    #[test(tokio::test(start_paused = true))]
    async fn lost_registration_is_restored_without_topology_change() {
        // Arrange
        let f = fixture(&["gpu-0", "gpu-1"], 2);
        let task = f.plugin.start().await.expect("plugin should start");

        // Act
        f.registrar.lose_registration();
        tokio::time::sleep(REGISTRATION_CHECK_PERIOD).await;
        wait_until(|| f.registrar.advertised().len() == 2).await;

        // Assert
        assert_eq!(f.registrar.advertised(), vec![4, 4], "same capacity advertised again");
        assert_eq!(f.topology.current().await.generation(), 1, "topology untouched");
        assert!(!f.registrar.registration_lost());
        f.plugin.stop().await.expect("stop");
        assert!(task.await.expect("join").is_ok());
    }

    #[test(tokio::test)]
    async fn stop_twice_is_harmless() {
        let f = fixture(&["gpu-0"], 1);
        let task = f.plugin.start().await.expect("plugin should start");

        f.plugin.stop().await.expect("first stop");
        f.plugin.stop().await.expect("second stop");

        assert_eq!(f.plugin.state(), PluginState::Stopped);
        assert_eq!(f.registrar.withdrawals(), 1);
        assert!(task.await.expect("join").is_ok());
    }

    #[test(tokio::test)]
    async fn start_fails_when_inventory_is_unreadable() {
        let f = fixture(&["gpu-0"], 1);
        f.provider.fail_inventory(true);

        let result = f.plugin.start().await;

        let err = result.err().expect("inventory failure is fatal");
        assert!(matches!(err.current_context(), PluginError::Inventory));
        assert_eq!(f.plugin.state(), PluginState::Stopped);
        assert!(f.registrar.advertised().is_empty());
    }

    #[test(tokio::test)]
    async fn second_start_is_rejected() {
        let f = fixture(&["gpu-0"], 1);
        f.plugin.start().await.expect("plugin should start");

        let result = f.plugin.start().await;

        assert!(matches!(
            result.err().map(|e| e.current_context().to_string()),
            Some(message) if message.contains("Running")
        ));
        f.plugin.stop().await.expect("stop");
    }
}
