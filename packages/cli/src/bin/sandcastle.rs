use clap::{Parser, Subcommand};
use colored::*;
use sandcastle_config::Config;
use std::process;

mod cli;

use cli::run::RunArgs;
use cli::sessions::SessionsCommands;

#[derive(Parser)]
#[command(name = "sandcastle")]
#[command(about = "Sandcastle - generate full-stack apps from a prompt inside a sandbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an application from a prompt
    Run(RunArgs),
    /// Inspect stored sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
    /// Remove containers left behind by earlier runs
    Cleanup,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    sandcastle_cli::init_tracing();

    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let config = Config::from_env()?;
    match command {
        Commands::Run(args) => args.execute(config).await,
        Commands::Sessions(cmd) => cmd.execute(config).await.map(|_| 0),
        Commands::Cleanup => cli::cleanup::execute(config).await.map(|_| 0),
    }
}
