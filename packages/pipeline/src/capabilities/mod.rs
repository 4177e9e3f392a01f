// ABOUTME: Pipeline stage contract and the helpers stages share
// ABOUTME: Reply block parsing, file/command tool calls and cancellable model calls

pub mod compiler_check;
pub mod generation;
pub mod planning;
pub mod preview;
pub mod template;

pub use compiler_check::CompilerCheckCapability;
pub use generation::GenerationCapability;
pub use planning::PlanningCapability;
pub use preview::PreviewCapability;
pub use template::TemplateCapability;

use crate::context::{CapabilityContext, CapabilityResult, Stage};
use crate::error::Result;
use crate::events::LiveEvent;
use crate::messages::retry_on_busy;
use crate::services::PipelineServices;
use async_trait::async_trait;
use regex::Regex;
use sandcastle_ai::{AIServiceResult, Generation, GenerationRequest};
use sandcastle_sandbox::{CommandOutput, SandboxError};
use sandcastle_storage::MessageRole;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Lines of command output echoed back onto the timeline
pub(crate) const OUTPUT_TAIL_LINES: usize = 20;

static BLOCK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<file\s+path\s*=\s*"([^"]*)"\s*>(.*?)</file>|<command>(.*?)</command>"#)
        .expect("valid reply block pattern")
});

/// One pipeline stage.
///
/// Expected failures come back as `Ok` with `success: false`. An `Err` is a
/// defect and ends the run.
#[async_trait]
pub trait Capability: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, context: &CapabilityContext) -> Result<CapabilityResult>;
}

/// A piece of a model reply, in reply order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySegment {
    Text(String),
    File { path: String, content: String },
    Command(String),
}

/// Split a reply into prose, `<file path="...">` blocks and `<command>` blocks
pub fn parse_reply(reply: &str) -> Vec<ReplySegment> {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in BLOCK_PATTERN.captures_iter(reply) {
        let Some(whole) = caps.get(0) else { continue };
        push_text(&mut segments, &reply[last..whole.start()]);
        last = whole.end();

        if let (Some(path), Some(body)) = (caps.get(1), caps.get(2)) {
            segments.push(ReplySegment::File {
                path: path.as_str().trim().to_string(),
                content: strip_block_newlines(body.as_str()),
            });
        } else if let Some(command) = caps.get(3) {
            let command = command.as_str().trim();
            if !command.is_empty() {
                segments.push(ReplySegment::Command(command.to_string()));
            }
        }
    }
    push_text(&mut segments, &reply[last..]);
    segments
}

pub fn count_files(segments: &[ReplySegment]) -> usize {
    segments
        .iter()
        .filter(|s| matches!(s, ReplySegment::File { .. }))
        .count()
}

fn push_text(segments: &mut Vec<ReplySegment>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        segments.push(ReplySegment::Text(text.to_string()));
    }
}

/// Drop the newline that follows the opening tag and the indentation before the closing tag
fn strip_block_newlines(body: &str) -> String {
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);
    let trimmed = body.trim_end_matches([' ', '\t']);
    if trimmed.ends_with('\n') {
        trimmed.to_string()
    } else {
        format!("{}\n", trimmed)
    }
}

/// What applying a reply did
#[derive(Debug, Default)]
pub(crate) struct AppliedReply {
    pub tool_calls: u32,
    pub written: Vec<String>,
    pub cancelled: bool,
}

/// Play a parsed reply against the sandbox: prose goes to the timeline, each
/// file or command is one tool call. Tool call failures are reported as system
/// messages and do not stop the remaining segments.
pub(crate) async fn apply_reply(
    services: &PipelineServices,
    ctx: &CapabilityContext,
    segments: &[ReplySegment],
) -> AppliedReply {
    let session_id = ctx.session_id.as_str();
    let mut applied = AppliedReply::default();

    for segment in segments {
        if ctx.cancel.is_cancelled() {
            applied.cancelled = true;
            break;
        }

        match segment {
            ReplySegment::Text(text) => {
                services.messages.emit(session_id, MessageRole::Assistant, text);
            }
            ReplySegment::File { path, content } => {
                applied.tool_calls += 1;
                match write_file(services, session_id, path, content).await {
                    Ok(()) => applied.written.push(path.clone()),
                    Err(e) => {
                        warn!(session_id = %session_id, path = %path, "File write rejected: {}", e);
                        services.messages.emit(
                            session_id,
                            MessageRole::System,
                            &format!("Skipped file {}: {}", path, e),
                        );
                    }
                }
                services.messages.reset(session_id);
            }
            ReplySegment::Command(command) => {
                applied.tool_calls += 1;
                let result = services
                    .executor
                    .execute_with_cancel(session_id, command, &ctx.cancel)
                    .await;
                let report = match result {
                    Ok(output) => describe_output(&output),
                    Err(SandboxError::CommandRejected { reason, .. }) => {
                        format!("Command rejected ({}): {}", reason, command)
                    }
                    Err(SandboxError::CommandCancelled(_)) => {
                        applied.cancelled = true;
                        break;
                    }
                    Err(e) => format!("Command could not run: {}: {}", command, e),
                };
                services
                    .messages
                    .emit(session_id, MessageRole::System, &report);
                services.messages.reset(session_id);
            }
        }
    }

    applied
}

/// Write a file into the sandbox, persist it and notify subscribers
pub(crate) async fn write_file(
    services: &PipelineServices,
    session_id: &str,
    path: &str,
    content: &str,
) -> sandcastle_sandbox::Result<()> {
    services.workspace.write_file(session_id, path, content).await?;

    let saved = retry_on_busy("save file", || {
        services.persistence.save_file(session_id, path, content)
    })
    .await;
    if let Err(e) = saved {
        warn!(session_id = %session_id, path = %path, "Failed to persist file: {}", e);
    }

    services.events.publish(
        session_id,
        LiveEvent::FileUpdated {
            path: path.to_string(),
            content: content.to_string(),
        },
    );
    debug!(session_id = %session_id, path = %path, "File written");
    Ok(())
}

/// Call the model unless the run is cancelled first. `None` means cancelled.
pub(crate) async fn generate(
    services: &PipelineServices,
    ctx: &CapabilityContext,
    request: GenerationRequest,
    on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Option<AIServiceResult<Generation>> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => None,
        result = services.model.generate(request, on_text) => Some(result),
    }
}

fn describe_output(output: &CommandOutput) -> String {
    let outcome = if output.timed_out {
        "timed out".to_string()
    } else if output.success {
        "succeeded".to_string()
    } else {
        format!("failed with exit code {}", output.exit_code.unwrap_or(-1))
    };

    let tail = tail_lines(&output.combined_output(), OUTPUT_TAIL_LINES);
    if tail.is_empty() {
        format!("$ {} ({})", output.command, outcome)
    } else {
        format!("$ {} ({})\n{}", output.command, outcome, tail)
    }
}

pub(crate) fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
