// ABOUTME: Produces the application from the prompt, plan and template
// ABOUTME: Applies the file and command blocks of the model reply as individual tool calls

use super::{apply_reply, count_files, generate, parse_reply, Capability};
use crate::context::{CapabilityContext, CapabilityResult, ContextUpdate, Stage};
use crate::error::Result;
use crate::services::PipelineServices;
use async_trait::async_trait;
use sandcastle_ai::GenerationRequest;
use sandcastle_sandbox::command::ALLOWED_PROGRAMS;
use std::sync::Arc;
use tracing::{info, warn};

pub struct GenerationCapability {
    services: Arc<PipelineServices>,
}

impl GenerationCapability {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }
}

/// Output contract shared by every stage that asks the model for files
pub(crate) fn file_format_instructions() -> String {
    format!(
        "Write every file in full as <file path=\"relative/path\">contents</file>. Paths are \
         relative to the project root and must stay inside it. To run a command, use \
         <command>npm install some-package</command>. Commands run without a shell: no \
         &&, ||, ;, pipes, backticks or $ expansion. Allowed programs: {}.",
        ALLOWED_PROGRAMS.join(", ")
    )
}

fn build_request(ctx: &CapabilityContext) -> GenerationRequest {
    let system = format!(
        "You are an expert full-stack TypeScript developer. Build the requested application on \
         top of the existing project: a React + Vite client in `client/` (port 5173) and an \
         Express server in `server/` (port 3000, routes under /api). {}",
        file_format_instructions()
    );

    let mut prompt = format!("Application request:\n{}\n", ctx.prompt);
    if let Some(plan) = &ctx.plan {
        prompt.push_str(&format!("\nArchitecture plan:\n{}\n", plan));
    }
    if !ctx.template_files.is_empty() {
        prompt.push_str("\nExisting files:\n");
        for path in &ctx.template_files {
            prompt.push_str(&format!("- {}\n", path));
        }
    }
    GenerationRequest::new(prompt).with_system(system)
}

#[async_trait]
impl Capability for GenerationCapability {
    fn stage(&self) -> Stage {
        Stage::Generation
    }

    async fn execute(&self, ctx: &CapabilityContext) -> Result<CapabilityResult> {
        let session_id = ctx.session_id.as_str();

        let mut on_text = |_: &str| {};
        let generation = match generate(&self.services, ctx, build_request(ctx), &mut on_text).await
        {
            None => return Ok(CapabilityResult::cancelled()),
            Some(Err(e)) => {
                warn!(session_id = %session_id, "Generation request failed: {}", e);
                return Ok(CapabilityResult::failure(format!("Generation failed: {}", e)));
            }
            Some(Ok(generation)) => generation,
        };

        let segments = parse_reply(&generation.text);
        if count_files(&segments) == 0 {
            return Ok(CapabilityResult::failure(
                "Model reply did not contain any files",
            ));
        }

        let applied = apply_reply(&self.services, ctx, &segments).await;
        let update = ContextUpdate {
            generated_files: applied.written.clone(),
            usage: Some(generation.usage),
            ..Default::default()
        };
        if applied.cancelled {
            return Ok(CapabilityResult::cancelled()
                .with_tool_calls(applied.tool_calls)
                .with_update(update));
        }

        info!(
            session_id = %session_id,
            files = applied.written.len(),
            tool_calls = applied.tool_calls,
            "Generation applied"
        );
        Ok(CapabilityResult::ok_with(applied.tool_calls, update))
    }
}
