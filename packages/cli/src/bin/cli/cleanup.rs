// ABOUTME: `sandcastle cleanup` removes session containers left by earlier processes
// ABOUTME: Connects to the local Docker daemon and stops every labelled container

use anyhow::Result;
use colored::*;
use sandcastle_config::Config;
use sandcastle_sandbox::{ContainerService, DockerRuntime, SandboxWorkspace};
use std::sync::Arc;

pub async fn execute(config: Config) -> Result<()> {
    let runtime = DockerRuntime::new()?;
    let service = ContainerService::new(
        Arc::new(runtime),
        SandboxWorkspace::new(&config.sandbox_root),
        &config,
    );

    let removed = service.cleanup_orphaned_containers().await?;
    if removed == 0 {
        println!("{}", "No orphaned containers found".yellow());
    } else {
        println!(
            "{} Removed {} orphaned container(s)",
            "✓".green().bold(),
            removed.to_string().cyan()
        );
    }
    Ok(())
}
