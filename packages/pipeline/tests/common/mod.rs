// ABOUTME: Shared fixtures for pipeline integration tests
// ABOUTME: Scripted model client and an orchestrator wired to a temp sandbox and in-memory SQLite

#![allow(dead_code)]

use async_trait::async_trait;
use sandcastle_ai::{AIServiceError, AIServiceResult, Generation, GenerationRequest, ModelClient, Usage};
use sandcastle_config::CommandSettings;
use sandcastle_pipeline::{Orchestrator, PipelineConfig, PipelineServices};
use sandcastle_sandbox::{CommandExecutor, ContainerService, SandboxWorkspace};
use sandcastle_storage::SqliteStorage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REPLY_USAGE: Usage = Usage {
    input_tokens: 100,
    output_tokens: 50,
};

/// Returns queued replies in order and records every request
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<AIServiceResult<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<AIServiceResult<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> AIServiceResult<Generation> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AIServiceError::ApiError("no scripted reply left".to_string())));
        let text = reply?;
        for chunk in text.split_inclusive(' ') {
            on_text(chunk);
        }
        Ok(Generation {
            text,
            usage: REPLY_USAGE,
        })
    }

    fn cost_usd(&self, usage: Usage) -> f64 {
        usage.total_tokens() as f64 * 0.001
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<SqliteStorage>,
    pub model: Arc<ScriptedModel>,
    pub workspace: SandboxWorkspace,
}

pub async fn harness(replies: Vec<AIServiceResult<String>>) -> Harness {
    harness_with(replies, Orchestrator::new).await
}

pub async fn harness_with<F>(replies: Vec<AIServiceResult<String>>, build: F) -> Harness
where
    F: FnOnce(Arc<PipelineServices>) -> Orchestrator,
{
    build_harness(replies, None, build).await
}

/// Harness whose preview stage starts containers through `containers`
pub async fn harness_with_containers(
    replies: Vec<AIServiceResult<String>>,
    containers: impl FnOnce(SandboxWorkspace) -> Arc<ContainerService> + 'static,
) -> Harness {
    build_harness(replies, Some(Box::new(containers)), Orchestrator::new).await
}

type ContainerFactory = Box<dyn FnOnce(SandboxWorkspace) -> Arc<ContainerService>>;

async fn build_harness<F>(
    replies: Vec<AIServiceResult<String>>,
    containers: Option<ContainerFactory>,
    build: F,
) -> Harness
where
    F: FnOnce(Arc<PipelineServices>) -> Orchestrator,
{
    let dir = tempfile::tempdir().unwrap();
    let workspace = SandboxWorkspace::new(dir.path().join("sandboxes"));
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let model = Arc::new(ScriptedModel::new(replies));
    let executor = CommandExecutor::new(workspace.clone(), CommandSettings::default());

    let mut services = PipelineServices::new(executor, workspace.clone(), model.clone(), storage.clone());
    if let Some(factory) = containers {
        services = services.with_containers(factory(workspace.clone()));
    }
    let services = Arc::new(services);

    Harness {
        dir,
        orchestrator: Arc::new(build(services)),
        storage,
        model,
        workspace,
    }
}

/// Only the listed stages enabled
pub fn only(template: bool, planning: bool, generation: bool, compiler_check: bool) -> PipelineConfig {
    PipelineConfig {
        template,
        planning,
        generation,
        compiler_check,
        preview: false,
        ..Default::default()
    }
}
