// ABOUTME: Asks the model for an architecture plan before any code is written
// ABOUTME: Streams the plan onto the timeline as it arrives and hands it to later stages

use super::{generate, Capability};
use crate::context::{CapabilityContext, CapabilityResult, ContextUpdate, Stage};
use crate::error::Result;
use crate::services::PipelineServices;
use async_trait::async_trait;
use sandcastle_ai::GenerationRequest;
use sandcastle_storage::MessageRole;
use std::sync::Arc;
use tracing::{info, warn};

const PLANNING_SYSTEM_PROMPT: &str = "You are a senior full-stack engineer planning a small web \
application. The project has a React + Vite TypeScript client in `client/` and an Express \
TypeScript server in `server/`. Reply with a concise plan in Markdown: the data model, the API \
routes, the client components, and the files you will create or change. Do not write code.";

pub struct PlanningCapability {
    services: Arc<PipelineServices>,
}

impl PlanningCapability {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Capability for PlanningCapability {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    async fn execute(&self, ctx: &CapabilityContext) -> Result<CapabilityResult> {
        let session_id = ctx.session_id.as_str();
        let messages = &self.services.messages;

        let mut prompt = format!("Application request:\n{}\n", ctx.prompt);
        if !ctx.template_files.is_empty() {
            prompt.push_str("\nExisting template files:\n");
            for path in &ctx.template_files {
                prompt.push_str(&format!("- {}\n", path));
            }
        }
        let request = GenerationRequest::new(prompt).with_system(PLANNING_SYSTEM_PROMPT);

        messages.reset(session_id);
        let mut on_text = |delta: &str| {
            messages.emit(session_id, MessageRole::Assistant, delta);
        };
        let outcome = generate(&self.services, ctx, request, &mut on_text).await;
        messages.reset(session_id);

        match outcome {
            None => Ok(CapabilityResult::cancelled()),
            Some(Err(e)) => {
                warn!(session_id = %session_id, "Planning request failed: {}", e);
                Ok(CapabilityResult::failure(format!("Planning failed: {}", e)))
            }
            Some(Ok(generation)) => {
                let plan = generation.text.trim().to_string();
                if plan.is_empty() {
                    return Ok(CapabilityResult::failure("Model returned an empty plan"));
                }
                info!(
                    session_id = %session_id,
                    output_tokens = generation.usage.output_tokens,
                    "Architecture plan ready"
                );
                Ok(CapabilityResult::ok_with(
                    0,
                    ContextUpdate {
                        plan: Some(plan),
                        usage: Some(generation.usage),
                        ..Default::default()
                    },
                ))
            }
        }
    }
}
