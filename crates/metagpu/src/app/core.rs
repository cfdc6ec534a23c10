use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::StartArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    args: StartArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, args: StartArgs) -> Self {
        Self { services, args }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn args(&self) -> &StartArgs {
        &self.args
    }

    /// Starts the plugin and all background tasks, then waits for a shutdown
    /// signal or the first task to end.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();

        if let Err(e) = tasks.spawn_all_tasks(self).await {
            tracing::error!("Failed to spawn application tasks: {e:?}");
            tasks.cancel();
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {e:?}");
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Withdraws the advertised capacity.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        self.services
            .plugin
            .stop()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to stop the metagpu plugin: {e:?}"))?;

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
