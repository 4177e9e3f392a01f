// ABOUTME: `sandcastle sessions` lists, shows and deletes stored sessions
// ABOUTME: Reads the session database directly; no model or container runtime is needed

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandcastle_config::Config;
use sandcastle_sandbox::SandboxWorkspace;
use sandcastle_storage::{Persistence, Session, SessionStatus, SqliteStorage};

#[derive(Subcommand)]
pub enum SessionsCommands {
    /// List all sessions, newest first
    List,
    /// Show a session with its timeline and files
    Show {
        /// Session ID
        id: String,
        /// Print full message content instead of the first line
        #[arg(long)]
        full: bool,
    },
    /// Delete a session and its stored timeline
    Delete {
        /// Session ID
        id: String,
        /// Also remove the generated files from the sandbox directory
        #[arg(long)]
        purge: bool,
    },
}

impl SessionsCommands {
    pub async fn execute(self, config: Config) -> Result<()> {
        let storage = SqliteStorage::new(&config.database_url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;

        match self {
            SessionsCommands::List => list_sessions(&storage).await,
            SessionsCommands::Show { id, full } => show_session(&storage, &id, full).await,
            SessionsCommands::Delete { id, purge } => {
                delete_session(&storage, &SandboxWorkspace::new(&config.sandbox_root), &id, purge).await
            }
        }
    }
}

async fn list_sessions(storage: &SqliteStorage) -> Result<()> {
    let sessions = storage.list_sessions().await?;

    if sessions.is_empty() {
        println!("{}", "No sessions found".yellow());
        println!("{}", "Use 'sandcastle run \"<prompt>\"' to start one".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["ID", "Prompt", "Status", "Tokens", "Cost", "Updated"]);

    for session in &sessions {
        table.add_row(vec![
            session.id.clone(),
            truncate(&session.prompt, 40),
            session.status.as_str().to_string(),
            (session.input_tokens + session.output_tokens).to_string(),
            format!("${:.4}", session.cost_usd),
            session.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    println!("{}", table);
    println!("Total: {} sessions", sessions.len().to_string().cyan());

    Ok(())
}

async fn show_session(storage: &SqliteStorage, id: &str, full: bool) -> Result<()> {
    let Some(session) = storage.get_session(id).await? else {
        anyhow::bail!("Session '{}' not found", id);
    };

    println!("{}", format!("Session {}", session.id).blue().bold());
    println!();
    print_session_details(&session);

    let messages = storage.list_messages(id).await?;
    println!();
    println!("{} ({})", "Timeline".bold(), messages.len());
    for message in &messages {
        let content = if full {
            message.content.clone()
        } else {
            truncate(message.content.lines().next().unwrap_or_default(), 100)
        };
        println!(
            "  {} {:<9} {}",
            message.timestamp.format("%H:%M:%S").to_string().dimmed(),
            message.role.as_str().cyan(),
            content
        );
    }

    let files = storage.list_files(id).await?;
    println!();
    println!("{} ({})", "Files".bold(), files.len());
    for file in &files {
        println!("  {} {}", file.path, format!("{} bytes", file.content.len()).dimmed());
    }

    Ok(())
}

fn print_session_details(session: &Session) {
    let status = match session.status {
        SessionStatus::Completed => session.status.as_str().green(),
        SessionStatus::Failed => session.status.as_str().red(),
        SessionStatus::Cancelled => session.status.as_str().yellow(),
        _ => session.status.as_str().cyan(),
    };

    println!("  {:<10} {}", "Prompt:".bold(), session.prompt);
    println!("  {:<10} {}", "Status:".bold(), status);
    if let Some(error) = &session.error_message {
        println!("  {:<10} {}", "Error:".bold(), error.red());
    }
    println!(
        "  {:<10} {} in / {} out",
        "Tokens:".bold(),
        session.input_tokens,
        session.output_tokens
    );
    println!("  {:<10} ${:.4}", "Cost:".bold(), session.cost_usd);
    println!("  {:<10} {:.1}s", "Duration:".bold(), session.duration_ms as f64 / 1000.0);
    println!("  {:<10} {}", "Created:".bold(), session.created_at.to_rfc3339());
    println!("  {:<10} {}", "Updated:".bold(), session.updated_at.to_rfc3339());
}

async fn delete_session(
    storage: &SqliteStorage,
    workspace: &SandboxWorkspace,
    id: &str,
    purge: bool,
) -> Result<()> {
    storage.delete_session(id).await?;
    println!("{} Deleted session {}", "✓".green().bold(), id.cyan());

    if purge {
        let path = workspace.sandbox_path(id)?;
        workspace
            .remove(id)
            .await
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        println!("  Removed {}", path.display().to_string().dimmed());
    }

    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a todo app with tags", 10), "a todo ...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
