// ABOUTME: Handles to the collaborators shared by every pipeline stage
// ABOUTME: Built once per process and passed to capabilities behind an Arc

use crate::events::EventHub;
use crate::messages::MessageTracker;
use sandcastle_ai::ModelClient;
use sandcastle_sandbox::{CommandExecutor, ContainerService, SandboxWorkspace};
use sandcastle_storage::Persistence;
use std::sync::Arc;

pub struct PipelineServices {
    pub workspace: SandboxWorkspace,
    pub executor: CommandExecutor,
    pub model: Arc<dyn ModelClient>,
    pub persistence: Arc<dyn Persistence>,
    pub events: Arc<EventHub>,
    pub messages: Arc<MessageTracker>,
    /// Absent when no container runtime is reachable; the preview stage then fails
    pub containers: Option<Arc<ContainerService>>,
}

impl PipelineServices {
    pub fn new(
        executor: CommandExecutor,
        workspace: SandboxWorkspace,
        model: Arc<dyn ModelClient>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let events = Arc::new(EventHub::default());
        let messages = Arc::new(MessageTracker::new(
            Arc::clone(&persistence),
            Arc::clone(&events),
        ));
        Self {
            workspace,
            executor,
            model,
            persistence,
            events,
            messages,
            containers: None,
        }
    }

    pub fn with_containers(mut self, containers: Arc<ContainerService>) -> Self {
        self.containers = Some(containers);
        self
    }
}
