// ABOUTME: Seeds the session sandbox with an embedded project template
// ABOUTME: Writes, persists and announces every template file before generation starts

use super::{write_file, Capability};
use crate::context::{CapabilityContext, CapabilityResult, ContextUpdate, Stage};
use crate::error::Result;
use crate::services::PipelineServices;
use async_trait::async_trait;
use sandcastle_storage::MessageRole;
use std::sync::Arc;
use tracing::info;

/// Client (Vite + React) and server (Express) TypeScript workspaces
const FULLSTACK: &[(&str, &str)] = &[
    ("package.json", include_str!("../../templates/fullstack/package.json")),
    ("client/package.json", include_str!("../../templates/fullstack/client/package.json")),
    ("client/tsconfig.json", include_str!("../../templates/fullstack/client/tsconfig.json")),
    ("client/vite.config.ts", include_str!("../../templates/fullstack/client/vite.config.ts")),
    ("client/index.html", include_str!("../../templates/fullstack/client/index.html")),
    ("client/src/main.tsx", include_str!("../../templates/fullstack/client/src/main.tsx")),
    ("client/src/App.tsx", include_str!("../../templates/fullstack/client/src/App.tsx")),
    ("server/package.json", include_str!("../../templates/fullstack/server/package.json")),
    ("server/tsconfig.json", include_str!("../../templates/fullstack/server/tsconfig.json")),
    ("server/src/index.ts", include_str!("../../templates/fullstack/server/src/index.ts")),
];

/// Files of a named template
pub fn template_files(name: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match name {
        "fullstack" => Some(FULLSTACK),
        _ => None,
    }
}

pub struct TemplateCapability {
    services: Arc<PipelineServices>,
}

impl TemplateCapability {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Capability for TemplateCapability {
    fn stage(&self) -> Stage {
        Stage::Template
    }

    async fn execute(&self, ctx: &CapabilityContext) -> Result<CapabilityResult> {
        let name = ctx.config.template_name.as_str();
        let Some(files) = template_files(name) else {
            return Ok(CapabilityResult::failure(format!("Unknown template '{}'", name)));
        };

        if let Err(e) = self.services.workspace.initialize(&ctx.session_id).await {
            return Ok(CapabilityResult::failure(format!(
                "Could not prepare sandbox: {}",
                e
            )));
        }

        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            if ctx.cancel.is_cancelled() {
                return Ok(CapabilityResult::cancelled());
            }
            if let Err(e) = write_file(&self.services, &ctx.session_id, path, content).await {
                return Ok(CapabilityResult::failure(format!(
                    "Failed to write template file {}: {}",
                    path, e
                )));
            }
            written.push(path.to_string());
        }

        info!(session_id = %ctx.session_id, template = %name, "Seeded {} template files", written.len());
        self.services.messages.emit(
            &ctx.session_id,
            MessageRole::System,
            &format!("Created {} project ({} files)", name, written.len()),
        );

        Ok(CapabilityResult::ok_with(
            0,
            ContextUpdate {
                template_files: Some(written),
                ..Default::default()
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fullstack_template_has_both_workspaces() {
        let files = template_files("fullstack").unwrap();
        let paths: Vec<&str> = files.iter().map(|(p, _)| *p).collect();
        assert!(paths.contains(&"client/tsconfig.json"));
        assert!(paths.contains(&"server/tsconfig.json"));

        let root = files.iter().find(|(p, _)| *p == "package.json").unwrap().1;
        let manifest: serde_json::Value = serde_json::from_str(root).unwrap();
        assert!(manifest["scripts"]["setup"].is_string());
        assert!(manifest["scripts"]["dev"].is_string());
    }

    #[test]
    fn test_unknown_template() {
        assert!(template_files("django").is_none());
    }
}
