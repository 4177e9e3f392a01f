// ABOUTME: Builds the long-lived services from configuration
// ABOUTME: The container runtime is optional; without it the preview stage reports itself unavailable

use anyhow::{Context, Result};
use sandcastle_ai::ModelClient;
use sandcastle_config::Config;
use sandcastle_pipeline::{Orchestrator, PipelineServices};
use sandcastle_sandbox::{CommandExecutor, ContainerRuntime, ContainerService, DockerRuntime, SandboxWorkspace};
use sandcastle_storage::SqliteStorage;
use std::sync::Arc;
use tracing::{info, warn};

pub struct App {
    pub config: Config,
    pub workspace: SandboxWorkspace,
    pub storage: Arc<SqliteStorage>,
    pub containers: Option<Arc<ContainerService>>,
    pub orchestrator: Arc<Orchestrator>,
}

impl App {
    /// Wire every service. With `with_runtime`, connect to the local Docker daemon
    /// and clear out containers left behind by an earlier process.
    pub async fn build(config: Config, model: Arc<dyn ModelClient>, with_runtime: bool) -> Result<Self> {
        let storage = Arc::new(
            SqliteStorage::new(&config.database_url)
                .await
                .with_context(|| format!("Failed to open database {}", config.database_url))?,
        );

        let workspace = SandboxWorkspace::new(&config.sandbox_root);
        let executor = CommandExecutor::new(workspace.clone(), config.command.clone());

        let containers = if with_runtime {
            connect_runtime(&config, workspace.clone()).await
        } else {
            None
        };

        let mut services = PipelineServices::new(executor, workspace.clone(), model, storage.clone());
        if let Some(containers) = &containers {
            services = services.with_containers(Arc::clone(containers));
        }
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(services)));

        info!(
            sandbox_root = %config.sandbox_root.display(),
            runtime = containers.is_some(),
            "Sandcastle services ready"
        );

        Ok(Self {
            config,
            workspace,
            storage,
            containers,
            orchestrator,
        })
    }

    /// Stop every container and cancel pending runs
    pub async fn shutdown(&self) {
        let cancelled = self.orchestrator.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} active run(s)", cancelled);
        }
        if let Some(containers) = &self.containers {
            containers.shutdown().await;
        }
    }
}

/// Container service on the local Docker daemon, or `None` when it is unreachable
pub async fn connect_runtime(config: &Config, workspace: SandboxWorkspace) -> Option<Arc<ContainerService>> {
    let runtime = match DockerRuntime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Docker client unavailable: {}", e);
            return None;
        }
    };
    match runtime.is_available().await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            warn!("Docker daemon is not reachable; live preview disabled");
            return None;
        }
    }

    match ContainerService::initialize(Arc::new(runtime), workspace, config).await {
        Ok(service) => Some(Arc::new(service)),
        Err(e) => {
            warn!("Container service failed to start: {}", e);
            None
        }
    }
}
