// ABOUTME: Renders live session events as terminal output
// ABOUTME: Streamed assistant text is printed incrementally; files and status changes get one line each

use colored::*;
use sandcastle_pipeline::LiveEvent;
use sandcastle_storage::{MessageRole, SessionStatus};

/// Turns the event stream into text, remembering how much of the open
/// message has already been printed.
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    open: Option<(String, usize)>,
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write for `event`, or `None` when there is nothing new
    pub fn render(&mut self, event: &LiveEvent) -> Option<String> {
        match event {
            LiveEvent::LlmMessage { id, role, content, .. } => self.render_message(id, *role, content),
            LiveEvent::FileUpdated { path, .. } => {
                Some(format!("{}  {} {}\n", self.break_line(), "wrote".green(), path))
            }
            LiveEvent::SessionStatus { status, error } => {
                let label = match status {
                    SessionStatus::Completed => status.as_str().green().bold(),
                    SessionStatus::Failed => status.as_str().red().bold(),
                    SessionStatus::Cancelled => status.as_str().yellow().bold(),
                    _ => status.as_str().cyan(),
                };
                let mut line = format!("{}Status: {}", self.break_line(), label);
                if let Some(error) = error {
                    line.push_str(&format!(" ({})", error.dimmed()));
                }
                line.push('\n');
                Some(line)
            }
        }
    }

    fn render_message(&mut self, id: &str, role: MessageRole, content: &str) -> Option<String> {
        if let Some((open_id, printed)) = &mut self.open {
            if open_id == id {
                let fresh = content.get(*printed..).unwrap_or_default();
                if fresh.is_empty() {
                    return None;
                }
                *printed = content.len();
                return Some(fresh.to_string());
            }
        }

        let prefix = self.break_line();
        match role {
            MessageRole::System => {
                self.open = None;
                Some(format!("{}{} {}\n", prefix, "•".cyan(), content.bold()))
            }
            MessageRole::User => {
                self.open = None;
                Some(format!("{}{} {}\n", prefix, ">".dimmed(), content))
            }
            MessageRole::Assistant => {
                self.open = Some((id.to_string(), content.len()));
                Some(format!("{}{}", prefix, content))
            }
        }
    }

    /// Newline needed to close a partially printed assistant message
    fn break_line(&mut self) -> &'static str {
        match self.open.take() {
            Some((_, printed)) if printed > 0 => "\n",
            _ => "",
        }
    }

    /// Text that must still be written once the stream ends
    pub fn finish(&mut self) -> &'static str {
        self.break_line()
    }
}
