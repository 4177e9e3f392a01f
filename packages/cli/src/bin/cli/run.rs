// ABOUTME: `sandcastle run` generates an application for a prompt
// ABOUTME: Streams session events to the terminal and cancels the run on Ctrl-C

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use sandcastle_ai::AIService;
use sandcastle_cli::{App, ProgressPrinter};
use sandcastle_config::constants::ANTHROPIC_API_KEY;
use sandcastle_config::Config;
use sandcastle_pipeline::{LiveEvent, PipelineConfig};
use sandcastle_storage::SessionStatus;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// What to build
    pub prompt: String,

    /// Session id to create, or to resume after an interrupted run (default: a new UUID)
    #[arg(long)]
    pub session: Option<String>,

    /// Project template to start from
    #[arg(long, default_value = "fullstack")]
    pub template: String,

    /// Skip copying the project template
    #[arg(long)]
    pub no_template: bool,

    /// Skip the planning stage
    #[arg(long)]
    pub no_planning: bool,

    /// Skip the TypeScript check and fix loop
    #[arg(long)]
    pub no_check: bool,

    /// Fix attempts allowed in the check loop
    #[arg(long, default_value = "3")]
    pub max_iterations: u32,

    /// Start a live preview container when generation succeeds
    #[arg(long)]
    pub preview: bool,

    /// Print events as JSON lines instead of formatted text
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            template: !self.no_template,
            planning: !self.no_planning,
            generation: true,
            compiler_check: !self.no_check,
            preview: self.preview,
            max_iterations: self.max_iterations,
            template_name: self.template.clone(),
        }
    }

    /// Run the pipeline and return the process exit code
    pub async fn execute(self, config: Config) -> Result<i32> {
        if std::env::var(ANTHROPIC_API_KEY).map_or(true, |key| key.trim().is_empty()) {
            anyhow::bail!("{} is not set", ANTHROPIC_API_KEY);
        }

        let app = App::build(config, Arc::new(AIService::new()), self.preview).await?;
        let session_id = self
            .session
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        println!("{} {}", "Session:".bold(), session_id.cyan());

        let events = app.orchestrator.services().events.subscribe(&session_id);
        let printer = tokio::spawn(print_events(events, self.json));

        let orchestrator = Arc::clone(&app.orchestrator);
        let (id, prompt, pipeline) = (session_id.clone(), self.prompt.clone(), self.pipeline_config());
        let mut run = tokio::spawn(async move { orchestrator.run(&id, &prompt, pipeline).await });

        let outcome = tokio::select! {
            joined = &mut run => joined,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Cancelling...".yellow());
                app.orchestrator.cancel(&session_id).ok();
                run.await
            }
        };
        let status = outcome.context("Pipeline task panicked")??;

        // Closing the room lets the printer drain buffered events and exit
        app.orchestrator.services().events.close_room(&session_id);
        printer.await.ok();

        if status == SessionStatus::Completed && self.preview && app.containers.is_some() {
            println!("{}", "Preview is running. Press Ctrl-C to stop.".dimmed());
            tokio::signal::ctrl_c().await.ok();
        }
        app.shutdown().await;

        println!();
        match status {
            SessionStatus::Completed => {
                println!("{} {}", "✓".green().bold(), "Generation completed".green());
                println!(
                    "  Files: {}",
                    app.workspace
                        .sandbox_path(&session_id)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                        .cyan()
                );
                Ok(0)
            }
            SessionStatus::Cancelled => {
                println!("{} {}", "!".yellow().bold(), "Generation cancelled".yellow());
                Ok(130)
            }
            other => {
                println!("{} Session ended as {}", "✗".red().bold(), other.as_str().red());
                Ok(1)
            }
        }
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<LiveEvent>, json: bool) {
    let mut printer = ProgressPrinter::new();
    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(event) => {
                if json {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                } else if let Some(text) = printer.render(&event) {
                    print!("{}", text);
                    stdout.flush().ok();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event printer fell behind; skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    print!("{}", printer.finish());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    #[test]
    fn test_flags_map_to_pipeline_config() {
        let harness = Harness::parse_from([
            "sandcastle",
            "a todo app",
            "--no-planning",
            "--max-iterations",
            "5",
            "--preview",
        ]);
        let config = harness.args.pipeline_config();

        assert!(config.template);
        assert!(!config.planning);
        assert!(config.generation);
        assert!(config.compiler_check);
        assert!(config.preview);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.template_name, "fullstack");
    }

    #[test]
    fn test_defaults_match_pipeline_defaults() {
        let harness = Harness::parse_from(["sandcastle", "a blog"]);
        assert_eq!(harness.args.pipeline_config(), PipelineConfig::default());
    }
}
