// ABOUTME: Starts the session container so the generated app can be previewed live
// ABOUTME: Runtime, port and readiness failures end the stage and release the session's ports

use super::Capability;
use crate::context::{CapabilityContext, CapabilityResult, Stage};
use crate::error::Result;
use crate::services::PipelineServices;
use async_trait::async_trait;
use sandcastle_sandbox::{ContainerService, SandboxError};
use sandcastle_storage::MessageRole;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PreviewCapability {
    services: Arc<PipelineServices>,
}

impl PreviewCapability {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }
}

/// Drop whatever entry a failed or cancelled start left behind so its ports return to the pool
async fn release(containers: &ContainerService, session_id: &str) {
    match containers.stop(session_id).await {
        Ok(()) | Err(SandboxError::SessionNotFound(_)) => {}
        Err(e) => warn!(session_id = %session_id, "Failed to release preview container: {}", e),
    }
}

#[async_trait]
impl Capability for PreviewCapability {
    fn stage(&self) -> Stage {
        Stage::Preview
    }

    async fn execute(&self, ctx: &CapabilityContext) -> Result<CapabilityResult> {
        let session_id = ctx.session_id.as_str();
        let Some(containers) = &self.services.containers else {
            return Ok(CapabilityResult::failure(
                "Preview is unavailable: no container runtime configured",
            ));
        };

        match containers.start(session_id, &ctx.cancel).await {
            Ok(_) if ctx.cancel.is_cancelled() => {
                release(containers, session_id).await;
                Ok(CapabilityResult::cancelled().with_tool_calls(1))
            }
            Ok(info) => {
                info!(
                    session_id = %session_id,
                    client_port = info.client_port,
                    server_port = info.server_port,
                    "Preview running"
                );
                self.services.messages.emit(
                    session_id,
                    MessageRole::System,
                    &format!(
                        "Preview running: client http://localhost:{}, server http://localhost:{}",
                        info.client_port, info.server_port
                    ),
                );
                Ok(CapabilityResult::ok(1))
            }
            Err(SandboxError::Cancelled) => {
                release(containers, session_id).await;
                Ok(CapabilityResult::cancelled().with_tool_calls(1))
            }
            Err(e) => {
                warn!(session_id = %session_id, "Preview failed: {}", e);
                release(containers, session_id).await;
                Ok(CapabilityResult::failure(format!("Preview failed: {}", e)).with_tool_calls(1))
            }
        }
    }
}
