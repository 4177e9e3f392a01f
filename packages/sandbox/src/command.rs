// ABOUTME: Validation and execution of LLM-authored commands inside a session sandbox
// ABOUTME: Enforces an allow-list, refuses shell metacharacters, and runs argv directly with time and output limits

use crate::error::{Result, SandboxError};
use crate::workspace::SandboxWorkspace;
use regex::Regex;
use sandcastle_config::CommandSettings;
use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Programs an LLM-authored command may start with
pub const ALLOWED_PROGRAMS: &[&str] = &[
    "echo", "pwd", "ls", "mkdir", "node", "npm", "pnpm", "npx", "cat", "touch", "cp", "mv", "head",
    "tail", "wc",
];

/// Host environment variables passed through to sandboxed processes
const PRESERVED_ENV: &[&str] = &["PATH", "HOME", "NODE_ENV"];

pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// How long to wait for pipe readers after a kill before giving up on them
const DRAIN_GRACE: Duration = Duration::from_secs(2);

static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`|\$\(|\$\{|\$[A-Za-z_]").expect("valid substitution pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Empty,
    NotWhitelisted,
    Chaining,
    Pipe,
    Substitution,
    Malformed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Empty => "empty command",
            RejectReason::NotWhitelisted => "not whitelisted",
            RejectReason::Chaining => "chaining",
            RejectReason::Pipe => "Pipe operator",
            RejectReason::Substitution => "substitution",
            RejectReason::Malformed => "malformed",
        };
        f.write_str(text)
    }
}

/// Check a raw command string and split it into an argument vector.
///
/// Rules are applied in a fixed order and the first failing rule determines the
/// reason: empty input, allow-list, chaining (`&&`, `||`, `;`), pipe, then
/// substitution/expansion. Unbalanced quotes are reported as malformed.
pub fn validate_command(raw: &str) -> Result<Vec<String>> {
    let reject = |reason: RejectReason| SandboxError::CommandRejected {
        reason,
        command: raw.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(reject(RejectReason::Empty));
    }

    let program = trimmed.split_whitespace().next().unwrap_or_default();
    if !ALLOWED_PROGRAMS.contains(&program) {
        return Err(reject(RejectReason::NotWhitelisted));
    }

    if trimmed.contains("&&") || trimmed.contains("||") || trimmed.contains(';') {
        return Err(reject(RejectReason::Chaining));
    }

    if trimmed.contains('|') {
        return Err(reject(RejectReason::Pipe));
    }

    if SUBSTITUTION_PATTERN.is_match(trimmed) {
        return Err(reject(RejectReason::Substitution));
    }

    split_args(trimmed).ok_or_else(|| reject(RejectReason::Malformed))
}

/// Split a command line into arguments honoring single quotes, double quotes and
/// backslash escapes. Returns `None` on an unbalanced quote or a trailing backslash.
pub fn split_args(input: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => current.push(other),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            escaped @ ('"' | '\\') => current.push(escaped),
                            other => {
                                current.push('\\');
                                current.push(other);
                            }
                        },
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_token = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }

    if in_token {
        args.push(current);
    }
    Some(args)
}

/// Outcome of one sandboxed command
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Convert an unsuccessful outcome into the matching error for callers that need success
    pub fn into_checked(self) -> Result<Self> {
        if self.timed_out {
            return Err(SandboxError::CommandTimeout {
                command: self.command,
                timeout_secs: self.duration_ms / 1000,
            });
        }
        if !self.success {
            return Err(SandboxError::CommandFailed {
                command: self.command,
                exit_code: self.exit_code.unwrap_or(-1),
            });
        }
        Ok(self)
    }

    /// stdout and stderr joined, as a type checker or build tool would print them
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// Runs validated commands as direct child processes in the session sandbox
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    workspace: SandboxWorkspace,
    settings: CommandSettings,
}

impl CommandExecutor {
    pub fn new(workspace: SandboxWorkspace, settings: CommandSettings) -> Self {
        Self {
            workspace,
            settings,
        }
    }

    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    pub async fn execute(&self, session_id: &str, raw: &str) -> Result<CommandOutput> {
        self.execute_with_cancel(session_id, raw, &CancellationToken::new())
            .await
    }

    /// Validate and run `raw` in the session's sandbox.
    ///
    /// A timeout is not an error: the process is killed and the output is marked
    /// `timed_out` with `success: false`. Cancellation kills the process and
    /// returns [`SandboxError::CommandCancelled`].
    pub async fn execute_with_cancel(
        &self,
        session_id: &str,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let argv = match validate_command(raw) {
            Ok(argv) => argv,
            Err(e) => {
                warn!(session_id = %session_id, command = %raw, "Rejected command: {}", e);
                return Err(e);
            }
        };
        let cwd = self.workspace.initialize(session_id).await?;

        info!(session_id = %session_id, command = %raw, "Executing command");
        let started = Instant::now();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PRESERVED_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command.spawn()?;
        let max_chars = self.settings.max_output_chars;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), max_chars));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), max_chars));

        let waited = tokio::select! {
            res = tokio::time::timeout(self.settings.timeout, child.wait()) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let (exit_code, timed_out) = match waited {
            Some(Ok(status)) => (status?.code(), false),
            Some(Err(_)) => {
                warn!(
                    session_id = %session_id,
                    command = %raw,
                    "Command exceeded {}s, killing",
                    self.settings.timeout.as_secs()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out command: {}", e);
                }
                (None, true)
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill cancelled command: {}", e);
                }
                stdout_task.abort();
                stderr_task.abort();
                info!(session_id = %session_id, command = %raw, "Command cancelled");
                return Err(SandboxError::CommandCancelled(raw.to_string()));
            }
        };

        let stdout = drain(stdout_task).await;
        let mut stderr = drain(stderr_task).await;
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Command timed out after {}s and was killed",
                self.settings.timeout.as_secs()
            ));
        }

        let output = CommandOutput {
            command: raw.to_string(),
            success: !timed_out && exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            session_id = %session_id,
            exit_code = ?output.exit_code,
            duration_ms = output.duration_ms,
            "Command finished"
        );
        Ok(output)
    }
}

async fn drain(task: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            String::new()
        }
        Err(_) => {
            debug!("Output pipe still held open after exit, dropping remainder");
            String::new()
        }
    }
}

/// Read a pipe to EOF, keeping at most `max_chars` characters
async fn read_capped<R>(reader: Option<R>, max_chars: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    // A UTF-8 character is at most four bytes
    let byte_budget = max_chars.saturating_mul(4);
    let mut kept = Vec::new();
    let mut overflowed = false;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = byte_budget.saturating_sub(kept.len());
                if n > room {
                    overflowed = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }

    truncate_output(&String::from_utf8_lossy(&kept), max_chars, overflowed)
}

/// Cap `text` at `max_chars` characters, appending a marker when anything was cut
pub fn truncate_output(text: &str, max_chars: usize, overflowed: bool) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((cut, _)) => format!(
            "{}\n{} (limit {} characters)",
            &text[..cut],
            TRUNCATION_MARKER,
            max_chars
        ),
        None if overflowed => format!(
            "{}\n{} (limit {} characters)",
            text, TRUNCATION_MARKER, max_chars
        ),
        None => text.to_string(),
    }
}
