// ABOUTME: Runs the enabled pipeline stages for a session, one run per session at a time
// ABOUTME: Merges stage results into the context, finalizes status and metrics, and supports cancellation

use crate::capabilities::{
    Capability, CompilerCheckCapability, GenerationCapability, PlanningCapability,
    PreviewCapability, TemplateCapability,
};
use crate::context::{CapabilityContext, PipelineConfig, Stage};
use crate::error::{PipelineError, Result};
use crate::events::LiveEvent;
use crate::messages::retry_on_busy;
use crate::services::PipelineServices;
use chrono::Utc;
use sandcastle_sandbox::{validate_session_id, SandboxError};
use sandcastle_storage::{MessageRole, Session, SessionStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

type ActiveRuns = Mutex<HashMap<String, CancellationToken>>;

/// Marks a session as running until dropped
struct ActiveRun<'a> {
    active: &'a ActiveRuns,
    session_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

pub struct Orchestrator {
    services: Arc<PipelineServices>,
    capabilities: BTreeMap<Stage, Arc<dyn Capability>>,
    active: ActiveRuns,
}

impl Orchestrator {
    /// Orchestrator with the built-in capability for every stage
    pub fn new(services: Arc<PipelineServices>) -> Self {
        let defaults: [Arc<dyn Capability>; 5] = [
            Arc::new(TemplateCapability::new(Arc::clone(&services))),
            Arc::new(PlanningCapability::new(Arc::clone(&services))),
            Arc::new(GenerationCapability::new(Arc::clone(&services))),
            Arc::new(CompilerCheckCapability::new(Arc::clone(&services))),
            Arc::new(PreviewCapability::new(Arc::clone(&services))),
        ];
        let capabilities = defaults
            .into_iter()
            .map(|capability| (capability.stage(), capability))
            .collect();

        Self {
            services,
            capabilities,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the capability that runs for its stage
    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.insert(capability.stage(), capability);
        self
    }

    pub fn services(&self) -> &Arc<PipelineServices> {
        &self.services
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Ask the active run of a session to stop at its next suspension point
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(session_id) {
            Some(token) => {
                info!(session_id = %session_id, "Cancelling pipeline run");
                token.cancel();
                Ok(())
            }
            None => Err(PipelineError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Cancel every active run
    pub fn cancel_all(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    fn claim(&self, session_id: &str, cancel: CancellationToken) -> Result<ActiveRun<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(session_id) {
            return Err(PipelineError::SessionBusy(session_id.to_string()));
        }
        active.insert(session_id.to_string(), cancel);
        Ok(ActiveRun {
            active: &self.active,
            session_id: session_id.to_string(),
        })
    }

    /// Run the enabled stages for `session_id` and return the final status.
    ///
    /// Fails fast with `SessionBusy` while another run of the same session is
    /// active, and with `SessionTerminal` once the session has completed,
    /// failed or been cancelled. A session left `pending` or `generating` by
    /// an interrupted process is resumed. A stage failure is not an error: it
    /// ends the run with `failed`.
    pub async fn run(
        &self,
        session_id: &str,
        prompt: &str,
        config: PipelineConfig,
    ) -> Result<SessionStatus> {
        validate_session_id(session_id).map_err(SandboxError::from)?;
        let cancel = CancellationToken::new();
        let _run = self.claim(session_id, cancel.clone())?;
        let started = Instant::now();

        let persistence = &self.services.persistence;
        let config_json = serde_json::to_value(&config).unwrap_or_default();
        let mut session = match retry_on_busy("load session", || persistence.get_session(session_id)).await? {
            Some(existing) if existing.status.is_terminal() => {
                return Err(PipelineError::SessionTerminal {
                    session_id: session_id.to_string(),
                    status: existing.status,
                });
            }
            Some(mut existing) => {
                existing.prompt = prompt.to_string();
                existing.config = config_json;
                existing
            }
            None => Session::new(session_id, prompt, config_json),
        };
        session.status = SessionStatus::Generating;
        session.error_message = None;
        session.updated_at = Utc::now();
        retry_on_busy("save session", || persistence.upsert_session(&session)).await?;

        self.services.events.publish(
            session_id,
            LiveEvent::SessionStatus {
                status: SessionStatus::Generating,
                error: None,
            },
        );
        self.services
            .messages
            .emit(session_id, MessageRole::User, prompt);
        info!(session_id = %session_id, stages = ?config.stages(), "Pipeline run started");

        let mut ctx = CapabilityContext::new(session_id, prompt, config, cancel.clone());
        let outcome = self.run_stages(&mut ctx).await;

        self.finish(session, &ctx, outcome, started).await
    }

    async fn run_stages(&self, ctx: &mut CapabilityContext) -> Outcome {
        let session_id = ctx.session_id.clone();

        for stage in ctx.config.stages() {
            if ctx.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let Some(capability) = self.capabilities.get(&stage) else {
                debug!(session_id = %session_id, stage = %stage, "No capability registered, skipping");
                continue;
            };

            self.services
                .messages
                .emit(&session_id, MessageRole::System, stage.description());
            info!(session_id = %session_id, stage = %stage, "Stage started");
            let stage_started = Instant::now();

            match capability.execute(ctx).await {
                Ok(result) => {
                    ctx.apply(&result);
                    if ctx.cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    if !result.success {
                        let failure = PipelineError::CapabilityFailure {
                            stage: stage.to_string(),
                            message: result
                                .error
                                .unwrap_or_else(|| "stage reported failure".to_string()),
                        };
                        warn!(session_id = %session_id, "{}", failure);
                        return Outcome::Failed(failure.to_string());
                    }
                    info!(
                        session_id = %session_id,
                        stage = %stage,
                        tool_calls = result.tool_calls,
                        duration_ms = stage_started.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                }
                Err(e) => {
                    error!(session_id = %session_id, stage = %stage, "Stage crashed: {}", e);
                    if ctx.cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    return Outcome::Failed(format!(
                        "Stage '{}' failed: internal error",
                        stage
                    ));
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::Completed
        }
    }

    async fn finish(
        &self,
        mut session: Session,
        ctx: &CapabilityContext,
        outcome: Outcome,
        started: Instant,
    ) -> Result<SessionStatus> {
        let session_id = ctx.session_id.as_str();
        let messages = &self.services.messages;

        let (status, error_message) = match outcome {
            Outcome::Completed => {
                messages.emit(session_id, MessageRole::System, "Generation completed");
                (SessionStatus::Completed, None)
            }
            Outcome::Cancelled => {
                messages.emit(session_id, MessageRole::System, "Generation cancelled");
                (SessionStatus::Cancelled, None)
            }
            Outcome::Failed(message) => {
                messages.emit(session_id, MessageRole::System, &message);
                (SessionStatus::Failed, Some(message))
            }
        };
        messages.cleanup(session_id).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        session.status = status;
        session.error_message = error_message.clone();
        session.input_tokens += u64::from(ctx.usage.input_tokens);
        session.output_tokens += u64::from(ctx.usage.output_tokens);
        session.cost_usd += self.services.model.cost_usd(ctx.usage);
        session.duration_ms += elapsed_ms;
        session.updated_at = Utc::now();

        let persistence = &self.services.persistence;
        if let Err(e) = retry_on_busy("save session", || persistence.upsert_session(&session)).await {
            error!(session_id = %session_id, "Failed to persist final session status: {}", e);
        }

        self.services.events.publish(
            session_id,
            LiveEvent::SessionStatus {
                status,
                error: error_message,
            },
        );
        info!(
            session_id = %session_id,
            status = %status,
            tool_calls = ctx.tool_calls,
            input_tokens = ctx.usage.input_tokens,
            output_tokens = ctx.usage.output_tokens,
            duration_ms = elapsed_ms,
            "Pipeline run finished"
        );
        Ok(status)
    }
}
