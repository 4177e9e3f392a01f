// ABOUTME: Iterative TypeScript check-and-fix loop
// ABOUTME: Type-checks each workspace, feeds the diagnostics back to the model and applies its fixes

use super::generation::file_format_instructions;
use super::{apply_reply, generate, parse_reply, tail_lines, Capability, OUTPUT_TAIL_LINES};
use crate::context::{CapabilityContext, CapabilityResult, ContextUpdate, Stage};
use crate::diagnostics::{self, DiagnosticError};
use crate::error::Result;
use crate::services::PipelineServices;
use async_trait::async_trait;
use sandcastle_ai::{GenerationRequest, Usage};
use sandcastle_sandbox::SandboxError;
use sandcastle_storage::MessageRole;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// TypeScript projects type-checked on every pass
pub const TYPESCRIPT_WORKSPACES: &[&str] = &["client", "server"];

/// Most source files attached to a fix request
const MAX_CONTEXT_FILES: usize = 10;

pub struct CompilerCheckCapability {
    services: Arc<PipelineServices>,
}

/// Why a check pass could not produce diagnostics
enum CheckAbort {
    Cancelled,
    Failed(String),
}

impl CompilerCheckCapability {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    /// Type-check every workspace that has a tsconfig and collect the diagnostics
    async fn check(
        &self,
        ctx: &CapabilityContext,
        tool_calls: &mut u32,
    ) -> std::result::Result<Vec<DiagnosticError>, CheckAbort> {
        let mut errors = Vec::new();

        for workspace in TYPESCRIPT_WORKSPACES {
            let tsconfig = format!("{}/tsconfig.json", workspace);
            let has_project = self
                .services
                .workspace
                .resolve(&ctx.session_id, &tsconfig)
                .map(|path| path.is_file())
                .unwrap_or(false);
            if !has_project {
                continue;
            }

            let command = format!("npx tsc --noEmit -p {}", workspace);
            *tool_calls += 1;
            let output = match self
                .services
                .executor
                .execute_with_cancel(&ctx.session_id, &command, &ctx.cancel)
                .await
            {
                Ok(output) => output,
                Err(SandboxError::CommandCancelled(_)) => return Err(CheckAbort::Cancelled),
                Err(e) => return Err(CheckAbort::Failed(format!("Type check could not run: {}", e))),
            };
            if output.timed_out {
                return Err(CheckAbort::Failed(format!(
                    "Type check of {} timed out",
                    workspace
                )));
            }

            let combined = output.combined_output();
            let parsed = diagnostics::parse(&combined, workspace);
            if parsed.is_empty() && !output.success {
                let exit = output
                    .exit_code
                    .map_or_else(|| "no exit code".to_string(), |code| format!("exit code {}", code));
                return Err(CheckAbort::Failed(format!(
                    "Type check of {} failed ({}) without reporting diagnostics:\n{}",
                    workspace,
                    exit,
                    tail_lines(&combined, OUTPUT_TAIL_LINES)
                )));
            }
            errors.extend(parsed);
        }

        Ok(errors)
    }

    async fn fix_request(&self, ctx: &CapabilityContext, errors: &[DiagnosticError]) -> GenerationRequest {
        let files: BTreeSet<&str> = errors.iter().map(|e| e.file.as_str()).collect();

        let mut prompt = format!(
            "The project has TypeScript errors. Fix them.\n\n{}\n",
            diagnostics::format_for_model(errors)
        );
        for file in files.into_iter().take(MAX_CONTEXT_FILES) {
            match self.services.workspace.read_file(&ctx.session_id, file).await {
                Ok(content) => {
                    prompt.push_str(&format!("\n<file path=\"{}\">\n{}</file>\n", file, content));
                }
                Err(e) => warn!(session_id = %ctx.session_id, file = %file, "Cannot attach file: {}", e),
            }
        }

        let system = format!(
            "You fix TypeScript compiler errors in a React + Vite client (`client/`) and an \
             Express server (`server/`). Change as little as possible and return only the files \
             you changed. {}",
            file_format_instructions()
        );
        GenerationRequest::new(prompt).with_system(system)
    }
}

/// Progress of the check-and-fix loop, reported whatever way the stage ends
struct LoopState {
    iteration: u32,
    tool_calls: u32,
    usage: Usage,
    written: Vec<String>,
    remaining: Option<usize>,
}

impl LoopState {
    fn finish(self, result: CapabilityResult) -> CapabilityResult {
        let tool_calls = self.tool_calls;
        result.with_tool_calls(tool_calls).with_update(ContextUpdate {
            generated_files: self.written,
            iteration: Some(self.iteration),
            last_diagnostic_count: self.remaining,
            usage: Some(self.usage),
            ..Default::default()
        })
    }

    fn abort(self, abort: CheckAbort) -> CapabilityResult {
        match abort {
            CheckAbort::Cancelled => self.finish(CapabilityResult::cancelled()),
            CheckAbort::Failed(message) => self.finish(CapabilityResult::failure(message)),
        }
    }
}

#[async_trait]
impl Capability for CompilerCheckCapability {
    fn stage(&self) -> Stage {
        Stage::CompilerCheck
    }

    async fn execute(&self, ctx: &CapabilityContext) -> Result<CapabilityResult> {
        let session_id = ctx.session_id.as_str();
        let messages = &self.services.messages;
        let max_iterations = ctx.config.max_iterations.max(1);

        let mut state = LoopState {
            iteration: ctx.iteration,
            tool_calls: 0,
            usage: Usage::default(),
            written: Vec::new(),
            remaining: None,
        };
        let mut fixes_pending = false;

        for pass in 1..=max_iterations {
            state.iteration += 1;
            let errors = match self.check(ctx, &mut state.tool_calls).await {
                Ok(errors) => errors,
                Err(abort) => return Ok(state.abort(abort)),
            };
            state.remaining = Some(errors.len());
            fixes_pending = false;
            info!(session_id = %session_id, pass, errors = errors.len(), "Type check pass finished");

            if errors.is_empty() {
                break;
            }

            messages.emit(
                session_id,
                MessageRole::System,
                &format!(
                    "Type check pass {}: {} error(s), requesting fixes",
                    pass,
                    errors.len()
                ),
            );

            let request = self.fix_request(ctx, &errors).await;
            let mut on_text = |_: &str| {};
            let generation = match generate(&self.services, ctx, request, &mut on_text).await {
                None => return Ok(state.abort(CheckAbort::Cancelled)),
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "Fix request failed: {}", e);
                    return Ok(state.abort(CheckAbort::Failed(format!("Fix request failed: {}", e))));
                }
                Some(Ok(generation)) => generation,
            };
            state.usage.add(generation.usage);

            let applied = apply_reply(&self.services, ctx, &parse_reply(&generation.text)).await;
            state.tool_calls += applied.tool_calls;
            state.written.extend(applied.written);
            if applied.cancelled {
                return Ok(state.abort(CheckAbort::Cancelled));
            }
            fixes_pending = true;
        }

        // The last pass applied fixes; measure what is left after them
        if fixes_pending {
            match self.check(ctx, &mut state.tool_calls).await {
                Ok(errors) => state.remaining = Some(errors.len()),
                Err(abort) => return Ok(state.abort(abort)),
            }
        }

        let iterations = state.iteration - ctx.iteration;
        let remaining = state.remaining.unwrap_or(0);
        let summary = if remaining == 0 {
            format!("Type check passed after {} iteration(s)", iterations)
        } else {
            format!(
                "Type check finished after {} iteration(s) with {} remaining error(s)",
                iterations, remaining
            )
        };
        messages.emit(session_id, MessageRole::System, &summary);
        info!(session_id = %session_id, remaining, "{}", summary);

        Ok(state.finish(CapabilityResult::ok(0)))
    }
}
