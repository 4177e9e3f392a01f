// ABOUTME: End-to-end pipeline runs against a scripted model, a temp sandbox and in-memory SQLite
// ABOUTME: Covers stage ordering, failure handling, run exclusivity, cancellation and persistence

mod common;

use async_trait::async_trait;
use common::{harness, harness_with, only, REPLY_USAGE};
use sandcastle_ai::AIServiceError;
use sandcastle_pipeline::{
    Capability, CapabilityContext, CapabilityResult, LiveEvent, Orchestrator, PipelineConfig,
    PipelineError, Stage,
};
use sandcastle_storage::{MessageRole, Persistence, Session, SessionStatus, StorageError};
use std::sync::Arc;
use tokio::sync::Notify;

const PLAN: &str = "1. Todo model\n2. REST routes under /api/todos\n3. TodoList component";

const GENERATION_REPLY: &str = r#"I'll build a todo API.
<file path="server/src/todos.ts">
export const todos: string[] = [];
</file>
<file path="client/src/Todo.tsx">
export function Todo() { return null; }
</file>
<command>echo installed</command>
<command>ls | wc -l</command>
<file path="../escape.ts">
bad
</file>
All done."#;

/// Blocks inside its stage until released, or until the run is cancelled
struct GateCapability {
    stage: Stage,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Capability for GateCapability {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: &CapabilityContext) -> sandcastle_pipeline::Result<CapabilityResult> {
        self.entered.notify_one();
        tokio::select! {
            _ = self.release.notified() => Ok(CapabilityResult::ok(0)),
            _ = ctx.cancel.cancelled() => Ok(CapabilityResult::cancelled()),
        }
    }
}

/// Fails with an internal error that must never reach subscribers
struct BrokenCapability;

#[async_trait]
impl Capability for BrokenCapability {
    fn stage(&self) -> Stage {
        Stage::Template
    }

    async fn execute(&self, _ctx: &CapabilityContext) -> sandcastle_pipeline::Result<CapabilityResult> {
        Err(PipelineError::Storage(StorageError::Database(
            "disk I/O error at page 0xdeadbeef".to_string(),
        )))
    }
}

fn gate(stage: Stage) -> (Arc<GateCapability>, Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let capability = Arc::new(GateCapability {
        stage,
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });
    (capability, entered, release)
}

#[tokio::test]
async fn test_full_run_generates_and_persists() {
    let h = harness(vec![Ok(PLAN.to_string()), Ok(GENERATION_REPLY.to_string())]).await;
    let mut live = h.orchestrator.services().events.subscribe("s1");

    let status = h
        .orchestrator
        .run("s1", "Build a todo app", only(true, true, true, false))
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Completed);

    // Sandbox holds template and generated files, traversal was refused
    let server = h.workspace.read_file("s1", "server/src/todos.ts").await.unwrap();
    assert_eq!(server, "export const todos: string[] = [];\n");
    assert!(h.workspace.read_file("s1", "client/tsconfig.json").await.is_ok());
    assert!(!h.dir.path().join("sandboxes").join("escape.ts").exists());

    // Generation saw the plan and the template
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].prompt.contains("REST routes under /api/todos"));
    assert!(requests[1].prompt.contains("- server/src/index.ts"));

    // Session metrics accumulate both model calls
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.error_message, None);
    assert_eq!(session.input_tokens, 2 * REPLY_USAGE.input_tokens as u64);
    assert_eq!(session.output_tokens, 2 * REPLY_USAGE.output_tokens as u64);
    assert!((session.cost_usd - 0.3).abs() < 1e-9);

    let files = h.storage.list_files("s1").await.unwrap();
    assert_eq!(files.len(), 12);

    // Timeline: prompt first, plan streamed into one message, tool results reported
    let messages = h.storage.list_messages("s1").await.unwrap();
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "Build a todo app");
    let plans: Vec<_> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant && m.content == PLAN)
        .collect();
    assert_eq!(plans.len(), 1);
    assert!(messages
        .iter()
        .any(|m| m.content == "Command rejected (Pipe operator): ls | wc -l"));
    assert!(messages
        .iter()
        .any(|m| m.content.starts_with("$ echo installed (succeeded)\ninstalled")));
    assert!(messages
        .iter()
        .any(|m| m.content.starts_with("Skipped file ../escape.ts")));
    assert_eq!(messages.last().unwrap().content, "Generation completed");

    // Live subscribers saw file updates and the final status last
    let mut events = Vec::new();
    while let Ok(event) = live.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| matches!(
        e,
        LiveEvent::FileUpdated { path, .. } if path == "client/src/Todo.tsx"
    )));
    assert_eq!(
        events.last(),
        Some(&LiveEvent::SessionStatus {
            status: SessionStatus::Completed,
            error: None
        })
    );
}

#[tokio::test]
async fn test_failing_stage_stops_the_pipeline() {
    let h = harness(vec![Err(AIServiceError::ApiError("overloaded".to_string()))]).await;
    let mut live = h.orchestrator.services().events.subscribe("s1");

    let status = h
        .orchestrator
        .run("s1", "Build a blog", only(false, true, true, false))
        .await
        .unwrap();

    assert_eq!(status, SessionStatus::Failed);
    // Generation never asked the model
    assert_eq!(h.model.requests().len(), 1);

    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    let error = session.error_message.unwrap();
    assert!(error.starts_with("Stage 'planning' failed: Planning failed"));

    let messages = h.storage.list_messages("s1").await.unwrap();
    assert_eq!(messages.last().unwrap().content, error);
    assert!(!messages
        .iter()
        .any(|m| m.content == Stage::Generation.description()));

    let mut last = None;
    while let Ok(event) = live.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(LiveEvent::SessionStatus {
            status: SessionStatus::Failed,
            error: Some(error)
        })
    );
}

#[tokio::test]
async fn test_reply_without_files_fails_generation() {
    let h = harness(vec![Ok("Sorry, I can only describe it.".to_string())]).await;

    let status = h
        .orchestrator
        .run("s1", "Build a chat app", only(false, false, true, false))
        .await
        .unwrap();

    assert_eq!(status, SessionStatus::Failed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(
        session.error_message.as_deref(),
        Some("Stage 'generation' failed: Model reply did not contain any files")
    );
}

#[tokio::test]
async fn test_second_run_for_same_session_is_busy() {
    let (capability, entered, release) = gate(Stage::Template);
    let h = harness_with(vec![], |services| {
        Orchestrator::new(services).with_capability(capability)
    })
    .await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let first = tokio::spawn(async move {
        orchestrator
            .run("s1", "first", only(true, false, false, false))
            .await
    });
    entered.notified().await;

    assert!(h.orchestrator.is_running("s1"));
    let second = h
        .orchestrator
        .run("s1", "second", only(true, false, false, false))
        .await;
    assert!(matches!(second, Err(PipelineError::SessionBusy(id)) if id == "s1"));

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), SessionStatus::Completed);
    assert!(!h.orchestrator.is_running("s1"));

    // The finished session is now terminal rather than busy
    let again = h
        .orchestrator
        .run("s1", "again", only(false, false, false, false))
        .await;
    assert!(matches!(again, Err(PipelineError::SessionTerminal { .. })));
}

#[tokio::test]
async fn test_cancel_ends_run_as_cancelled() {
    let (capability, entered, _release) = gate(Stage::Template);
    let h = harness_with(vec![Ok(PLAN.to_string())], |services| {
        Orchestrator::new(services).with_capability(capability)
    })
    .await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let run = tokio::spawn(async move {
        orchestrator
            .run("s1", "cancel me", only(true, true, false, false))
            .await
    });
    entered.notified().await;

    h.orchestrator.cancel("s1").unwrap();
    assert_eq!(run.await.unwrap().unwrap(), SessionStatus::Cancelled);

    // Planning never ran
    assert!(h.model.requests().is_empty());
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(matches!(
        h.orchestrator.cancel("s1"),
        Err(PipelineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_stage_defect_is_reported_generically() {
    let h = harness_with(vec![], |services| {
        Orchestrator::new(services).with_capability(Arc::new(BrokenCapability))
    })
    .await;

    let status = h
        .orchestrator
        .run("s1", "anything", PipelineConfig::default())
        .await
        .unwrap();

    assert_eq!(status, SessionStatus::Failed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    let error = session.error_message.unwrap();
    assert_eq!(error, "Stage 'template' failed: internal error");

    let messages = h.storage.list_messages("s1").await.unwrap();
    assert!(messages.iter().all(|m| !m.content.contains("0xdeadbeef")));
}

#[tokio::test]
async fn test_unknown_template_fails() {
    let h = harness(vec![]).await;
    let config = PipelineConfig {
        template_name: "rails".to_string(),
        ..only(true, false, false, false)
    };

    let status = h.orchestrator.run("s1", "app", config).await.unwrap();

    assert_eq!(status, SessionStatus::Failed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(
        session.error_message.as_deref(),
        Some("Stage 'template' failed: Unknown template 'rails'")
    );
}

#[tokio::test]
async fn test_preview_without_runtime_fails() {
    let h = harness(vec![]).await;
    let config = PipelineConfig {
        preview: true,
        ..only(false, false, false, false)
    };

    let status = h.orchestrator.run("s1", "app", config).await.unwrap();

    assert_eq!(status, SessionStatus::Failed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert!(session
        .error_message
        .unwrap()
        .contains("no container runtime configured"));
}

#[tokio::test]
async fn test_invalid_session_id_is_refused() {
    let h = harness(vec![]).await;
    let result = h
        .orchestrator
        .run("../etc", "app", PipelineConfig::default())
        .await;
    assert!(matches!(result, Err(PipelineError::Sandbox(_))));
    assert!(h.storage.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_session_cannot_run_again() {
    let h = harness(vec![Ok(PLAN.to_string()), Ok(PLAN.to_string())]).await;
    let config = only(false, true, false, false);

    let status = h.orchestrator.run("s1", "v1", config.clone()).await.unwrap();
    assert_eq!(status, SessionStatus::Completed);

    let result = h.orchestrator.run("s1", "v2", config).await;
    assert!(matches!(
        result,
        Err(PipelineError::SessionTerminal { ref session_id, status: SessionStatus::Completed })
            if session_id == "s1"
    ));
    assert!(!h.orchestrator.is_running("s1"));
    assert_eq!(h.model.requests().len(), 1);

    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.prompt, "v1");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.input_tokens, REPLY_USAGE.input_tokens as u64);
}

#[tokio::test]
async fn test_failed_session_cannot_run_again() {
    let h = harness(vec![]).await;
    let config = only(false, true, false, false);

    let status = h.orchestrator.run("s1", "v1", config.clone()).await.unwrap();
    assert_eq!(status, SessionStatus::Failed);

    let result = h.orchestrator.run("s1", "v1", config).await;
    assert!(matches!(
        result,
        Err(PipelineError::SessionTerminal { status: SessionStatus::Failed, .. })
    ));
}

#[tokio::test]
async fn test_interrupted_session_is_resumed() {
    let h = harness(vec![Ok(PLAN.to_string())]).await;
    let mut stale = Session::new("s1", "v1", serde_json::json!({}));
    stale.status = SessionStatus::Generating;
    h.storage.upsert_session(&stale).await.unwrap();

    let status = h
        .orchestrator
        .run("s1", "v2", only(false, true, false, false))
        .await
        .unwrap();

    assert_eq!(status, SessionStatus::Completed);
    let session = h.storage.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.prompt, "v2");
}
