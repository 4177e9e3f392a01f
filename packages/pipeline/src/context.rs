// ABOUTME: Shared state threaded through the pipeline stages of one run
// ABOUTME: Pipeline configuration, the capability context, partial updates and the uniform stage result

use sandcastle_ai::Usage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_TEMPLATE: &str = "fullstack";

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Template,
    Planning,
    Generation,
    CompilerCheck,
    Preview,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Template,
        Stage::Planning,
        Stage::Generation,
        Stage::CompilerCheck,
        Stage::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Template => "template",
            Stage::Planning => "planning",
            Stage::Generation => "generation",
            Stage::CompilerCheck => "compiler_check",
            Stage::Preview => "preview",
        }
    }

    /// Progress line shown on the timeline when the stage starts
    pub fn description(&self) -> &'static str {
        match self {
            Stage::Template => "Setting up project template",
            Stage::Planning => "Planning the application architecture",
            Stage::Generation => "Generating application code",
            Stage::CompilerCheck => "Checking the code with the TypeScript compiler",
            Stage::Preview => "Starting the live preview",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages run for a session, and their tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub template: bool,
    pub planning: bool,
    pub generation: bool,
    pub compiler_check: bool,
    pub preview: bool,
    pub max_iterations: u32,
    pub template_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            template: true,
            planning: true,
            generation: true,
            compiler_check: true,
            preview: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            template_name: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Template => self.template,
            Stage::Planning => self.planning,
            Stage::Generation => self.generation,
            Stage::CompilerCheck => self.compiler_check,
            Stage::Preview => self.preview,
        }
    }

    /// Enabled stages in their fixed order
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }
}

/// Session-scoped state owned by the active run
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    pub session_id: String,
    pub prompt: String,
    pub config: PipelineConfig,
    pub template_files: Vec<String>,
    pub plan: Option<String>,
    pub generated_files: BTreeSet<String>,
    pub iteration: u32,
    pub tool_calls: u32,
    pub last_diagnostic_count: Option<usize>,
    pub usage: Usage,
    pub cancel: CancellationToken,
}

impl CapabilityContext {
    pub fn new(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            config,
            template_files: Vec::new(),
            plan: None,
            generated_files: BTreeSet::new(),
            iteration: 0,
            tool_calls: 0,
            last_diagnostic_count: None,
            usage: Usage::default(),
            cancel,
        }
    }

    /// Merge a stage's result into the context
    pub fn apply(&mut self, result: &CapabilityResult) {
        self.tool_calls += result.tool_calls;
        let Some(update) = &result.context_updates else {
            return;
        };
        if let Some(files) = &update.template_files {
            self.template_files = files.clone();
        }
        if let Some(plan) = &update.plan {
            self.plan = Some(plan.clone());
        }
        self.generated_files
            .extend(update.generated_files.iter().cloned());
        if let Some(iteration) = update.iteration {
            self.iteration = iteration;
        }
        if let Some(count) = update.last_diagnostic_count {
            self.last_diagnostic_count = Some(count);
        }
        if let Some(usage) = update.usage {
            self.usage.add(usage);
        }
    }
}

/// Partial context produced by a stage. Set fields replace, lists extend, usage adds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub template_files: Option<Vec<String>>,
    pub plan: Option<String>,
    pub generated_files: Vec<String>,
    pub iteration: Option<u32>,
    pub last_diagnostic_count: Option<usize>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityResult {
    pub success: bool,
    pub error: Option<String>,
    pub tool_calls: u32,
    pub context_updates: Option<ContextUpdate>,
}

impl CapabilityResult {
    pub fn ok(tool_calls: u32) -> Self {
        Self {
            success: true,
            tool_calls,
            ..Default::default()
        }
    }

    pub fn ok_with(tool_calls: u32, update: ContextUpdate) -> Self {
        Self {
            success: true,
            tool_calls,
            context_updates: Some(update),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::failure("Cancelled")
    }

    pub fn with_tool_calls(mut self, tool_calls: u32) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_update(mut self, update: ContextUpdate) -> Self {
        self.context_updates = Some(update);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_stage_order() {
        assert_eq!(
            PipelineConfig::default().stages(),
            vec![
                Stage::Template,
                Stage::Planning,
                Stage::Generation,
                Stage::CompilerCheck
            ]
        );
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let config = PipelineConfig {
            planning: false,
            preview: true,
            ..Default::default()
        };
        assert_eq!(
            config.stages(),
            vec![
                Stage::Template,
                Stage::Generation,
                Stage::CompilerCheck,
                Stage::Preview
            ]
        );
    }

    #[test]
    fn test_config_fills_missing_fields() {
        let config: PipelineConfig = serde_json::from_str(r#"{"planning": false}"#).unwrap();
        assert!(!config.planning);
        assert!(config.template);
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.template_name, "fullstack");
    }

    #[test]
    fn test_apply_merges_updates() {
        let mut ctx = CapabilityContext::new(
            "s1",
            "todo app",
            PipelineConfig::default(),
            CancellationToken::new(),
        );
        ctx.apply(&CapabilityResult::ok_with(
            0,
            ContextUpdate {
                template_files: Some(vec!["package.json".to_string()]),
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                ..Default::default()
            },
        ));
        ctx.apply(&CapabilityResult::ok_with(
            3,
            ContextUpdate {
                generated_files: vec!["client/src/App.tsx".to_string()],
                iteration: Some(2),
                last_diagnostic_count: Some(0),
                usage: Some(Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                }),
                ..Default::default()
            },
        ));
        ctx.apply(&CapabilityResult::failure("nope").with_tool_calls(1));

        assert_eq!(ctx.template_files, vec!["package.json".to_string()]);
        assert!(ctx.generated_files.contains("client/src/App.tsx"));
        assert_eq!(ctx.iteration, 2);
        assert_eq!(ctx.tool_calls, 4);
        assert_eq!(ctx.last_diagnostic_count, Some(0));
        assert_eq!(ctx.usage.input_tokens, 11);
        assert_eq!(ctx.usage.output_tokens, 6);
    }
}
