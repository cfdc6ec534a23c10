use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::service::ManagementServer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    /// Starts the plugin, then every background task.
    pub async fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let plugin_task = self.spawn_plugin_task(app).await?;
        self.tasks.push(plugin_task);

        let config_watcher_task = self.spawn_config_watcher_task(app);
        self.tasks.push(config_watcher_task);

        let discovery_task = self.spawn_process_discovery_task(app);
        self.tasks.push(discovery_task);

        if let Some(pod_watcher_task) = self.spawn_pod_watcher_task(app) {
            self.tasks.push(pod_watcher_task);
        }

        if let Some(pod_resources_task) = self.spawn_pod_resources_task(app) {
            self.tasks.push(pod_resources_task);
        }

        let server_task = self.spawn_management_server_task(app);
        self.tasks.push(server_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        let first_finished = async {
            let (result, index, _) = futures::future::select_all(self.tasks.iter_mut()).await;
            (result, index)
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            (result, index) = first_finished => {
                self.tasks.swap_remove(index);
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;

                match result {
                    Ok(Ok(())) => tracing::warn!("Task completed unexpectedly"),
                    Ok(Err(e)) => {
                        tracing::error!("Task failed: {e:?}");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!("Task panicked or was aborted: {e}");
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Task ended with error during shutdown: {e:?}"),
                    Err(e) => tracing::error!("Task failed during shutdown: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    async fn spawn_plugin_task(&self, app: &Application) -> Result<JoinHandle<Result<()>>> {
        let plugin = app.services().plugin.clone();
        let mut loops = plugin
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start the metagpu plugin: {e:?}"))?;
        let token = self.cancellation_token.clone();

        Ok(tokio::spawn(async move {
            tracing::info!("Metagpu plugin loops running");
            tokio::select! {
                result = &mut loops => {
                    result?.map_err(|e| anyhow::anyhow!("Metagpu plugin failed: {e:?}"))?;
                }
                _ = token.cancelled() => {
                    plugin
                        .stop()
                        .await
                        .map_err(|e| anyhow::anyhow!("Failed to stop the metagpu plugin: {e:?}"))?;
                    loops
                        .await?
                        .map_err(|e| anyhow::anyhow!("Metagpu plugin failed: {e:?}"))?;
                }
            }
            tracing::info!("Metagpu plugin loops completed");
            Ok(())
        }))
    }

    fn spawn_config_watcher_task(&self, app: &Application) -> JoinHandle<Result<()>> {
        let watcher = app.services().config_watcher.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting configuration watcher task");
            watcher
                .run(token)
                .await
                .map_err(|e| anyhow::anyhow!("Configuration watcher failed: {e:?}"))?;
            tracing::info!("Configuration watcher task completed");
            Ok(())
        })
    }

    fn spawn_process_discovery_task(&self, app: &Application) -> JoinHandle<Result<()>> {
        let registry = app.services().registry.clone();
        let period = app.services().config.current().processes_discovery_period();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting process discovery task");
            registry.run(period, token).await;
            tracing::info!("Process discovery task completed");
            Ok(())
        })
    }

    fn spawn_pod_watcher_task(&self, app: &Application) -> Option<JoinHandle<Result<()>>> {
        let pod_watcher = app.services().pod_watcher.clone()?;
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod watcher task");
            pod_watcher
                .run(token)
                .await
                .map_err(|e| anyhow::anyhow!("Kubernetes pod watcher failed: {e:?}"))?;
            tracing::info!("Kubernetes pod watcher completed");
            Ok(())
        }))
    }

    fn spawn_pod_resources_task(&self, app: &Application) -> Option<JoinHandle<Result<()>>> {
        let pod_resources = app.services().pod_resources.clone()?;
        let period = app.services().config.current().allocation_sync_period();
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting pod resources watcher task");
            pod_resources.run(period, token).await;
            tracing::info!("Pod resources watcher task completed");
            Ok(())
        }))
    }

    fn spawn_management_server_task(&self, app: &Application) -> JoinHandle<Result<()>> {
        let server = ManagementServer::new(
            app.args().metagpu_server_addr,
            app.services().management.clone(),
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            server
                .run(token)
                .await
                .map_err(|e| anyhow::anyhow!("Management API failed: {e:?}"))?;
            tracing::info!("Management API completed");
            Ok(())
        })
    }
}
