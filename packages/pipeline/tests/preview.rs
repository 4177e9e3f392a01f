// ABOUTME: Preview stage against a container runtime that refuses to create containers
// ABOUTME: A failed preview must hand its reserved ports back to the container service

mod common;

use async_trait::async_trait;
use common::{harness_with_containers, only};
use sandcastle_config::{Config, PortRange};
use sandcastle_pipeline::PipelineConfig;
use sandcastle_sandbox::providers::{
    ContainerRuntime, ContainerSpec, LogByteStream, ProviderError, Result as ProviderResult,
    RuntimeContainer,
};
use sandcastle_sandbox::{ContainerService, SandboxError};
use sandcastle_storage::{Persistence, SessionStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime whose daemon rejects every create with a server error
#[derive(Default)]
struct BrokenRuntime {
    creates: AtomicU32,
}

#[async_trait]
impl ContainerRuntime for BrokenRuntime {
    async fn is_available(&self) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn image_exists(&self, _image: &str) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> ProviderResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Api {
            status_code: 500,
            message: "daemon exploded".to_string(),
        })
    }

    async fn start_container(&self, _container_id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn attach_logs(&self, _container_id: &str) -> ProviderResult<LogByteStream> {
        Err(ProviderError::ContainerError("no logs".to_string()))
    }

    async fn stop_container(&self, _container_id: &str, _timeout_secs: u64) -> ProviderResult<()> {
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str, _force: bool) -> ProviderResult<()> {
        Ok(())
    }

    async fn list_containers(&self, _label: &str) -> ProviderResult<Vec<RuntimeContainer>> {
        Ok(Vec::new())
    }
}

fn preview_only() -> PipelineConfig {
    PipelineConfig {
        preview: true,
        ..only(false, false, false, false)
    }
}

#[tokio::test]
async fn test_failed_preview_releases_ports() {
    let runtime = Arc::new(BrokenRuntime::default());
    let factory_runtime = Arc::clone(&runtime);
    let h = harness_with_containers(vec![], move |workspace| {
        let config = Config {
            // Room for exactly one session's client and server port
            ports: PortRange::new(4900, 4901).unwrap(),
            ..Config::default()
        };
        Arc::new(ContainerService::new(factory_runtime, workspace, &config))
    })
    .await;
    let containers = Arc::clone(h.orchestrator.services().containers.as_ref().unwrap());

    let status = h.orchestrator.run("s1", "app", preview_only()).await.unwrap();

    assert_eq!(status, SessionStatus::Failed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert!(session.error_message.unwrap().starts_with("Stage 'preview' failed: Preview failed"));

    assert!(containers.list().await.is_empty());
    assert!(matches!(
        containers.status("s1").await,
        Err(SandboxError::SessionNotFound(_))
    ));

    // The only two ports in the range are free again for the next session
    let next = containers.start("s2", &CancellationToken::new()).await;
    assert!(matches!(next, Err(SandboxError::ContainerStartFailed { .. })));
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);
}
