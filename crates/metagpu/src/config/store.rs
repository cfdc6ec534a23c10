use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ConfigError;
use crate::config::MetaGpuConfig;
use crate::signal::RecalcSignal;

/// Owner of the active configuration.
///
/// Readers get an `Arc` to a complete configuration, a reload swaps the
/// whole value.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<MetaGpuConfig>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: MetaGpuConfig) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, Report<ConfigError>> {
        let path = path.into();
        let config = MetaGpuConfig::load(&path)?;
        Ok(Self::new(path, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<MetaGpuConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in `config` if it differs from the active one.
    pub fn replace(&self, config: MetaGpuConfig) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if **current == config {
            return false;
        }
        *current = Arc::new(config);
        true
    }

    /// Re-reads the file; an invalid file leaves the active configuration untouched.
    pub fn reload(&self) -> Result<bool, Report<ConfigError>> {
        let config = MetaGpuConfig::load(&self.path)?;
        Ok(self.replace(config))
    }
}

/// Watches the configuration file and fires a recalculation on effective changes.
pub struct ConfigWatcher {
    store: Arc<ConfigStore>,
    signal: Arc<RecalcSignal>,
}

impl ConfigWatcher {
    pub fn new(store: Arc<ConfigStore>, signal: Arc<RecalcSignal>) -> Self {
        Self { store, signal }
    }

    /// Reloads the configuration, returns whether a new one was swapped in.
    pub fn apply_reload(&self) -> bool {
        match self.store.reload() {
            Ok(true) => {
                let config = self.store.current();
                info!(
                    meta_gpus_per_device = config.meta_gpus_per_device,
                    "configuration changed, scheduling topology recalculation"
                );
                self.signal.trigger();
                true
            }
            Ok(false) => {
                debug!("configuration file touched without effective changes");
                false
            }
            Err(e) => {
                warn!("ignoring configuration change: {e:?}");
                false
            }
        }
    }

    #[tracing::instrument(skip_all, fields(path = %self.store.path().display()))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), Report<ConfigError>> {
        // ConfigMap mounts swap the file through a symlink in the parent directory
        let dir = match self.store.path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // receiver gone means the watcher is shutting down
                    let _ = tx.send(event);
                }
                Err(e) => error!("configuration watch error: {e:?}"),
            },
            Config::default(),
        )
        .change_context(ConfigError::Watch {
            path: dir.display().to_string(),
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context(ConfigError::Watch {
                path: dir.display().to_string(),
            })?;

        info!("watching configuration for changes");
        loop {
            select! {
                _ = token.cancelled() => {
                    info!("configuration watcher shutdown requested");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        warn!("configuration watch channel closed");
                        break;
                    };
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        debug!(paths = ?event.paths, "configuration directory changed");
                        self.apply_reload();
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(path: &Path, fraction: u32) {
        std::fs::write(
            path,
            format!("jwtSecret: secret\nmetaGpusPerDevice: {fraction}\n"),
        )
        .expect("should write config");
    }

    #[test]
    fn reload_with_identical_content_does_not_signal() {
        // Arrange
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        write_config(&path, 4);
        let store = Arc::new(ConfigStore::load(&path).expect("should load"));
        let signal = Arc::new(RecalcSignal::new());
        let watcher = ConfigWatcher::new(store.clone(), signal.clone());

        // Act
        write_config(&path, 4);
        let swapped = watcher.apply_reload();

        // Assert
        assert!(!swapped, "unchanged configuration must not be swapped");
        assert!(!signal.take_pending(), "no recalculation expected");
    }

    #[test]
    fn reload_with_changed_content_signals_once() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        write_config(&path, 4);
        let store = Arc::new(ConfigStore::load(&path).expect("should load"));
        let signal = Arc::new(RecalcSignal::new());
        let watcher = ConfigWatcher::new(store.clone(), signal.clone());

        write_config(&path, 2);
        let swapped = watcher.apply_reload();

        assert!(swapped, "changed configuration should be swapped in");
        assert_eq!(store.current().meta_gpus_per_device, 2);
        assert!(signal.take_pending(), "recalculation expected");
        assert!(!signal.take_pending(), "exactly one recalculation expected");
    }

    #[test]
    fn invalid_edit_keeps_previous_configuration() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        write_config(&path, 4);
        let store = Arc::new(ConfigStore::load(&path).expect("should load"));
        let signal = Arc::new(RecalcSignal::new());
        let watcher = ConfigWatcher::new(store.clone(), signal.clone());

        write_config(&path, 0);
        let swapped = watcher.apply_reload();

        assert!(!swapped);
        assert_eq!(store.current().meta_gpus_per_device, 4);
        assert!(!signal.is_pending());
    }
}
