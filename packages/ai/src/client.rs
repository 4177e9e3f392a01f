// ABOUTME: ModelClient trait: the seam between pipeline stages and a text-generation backend

use crate::service::AIServiceResult;
use crate::usage::Usage;
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Complete result of one generation call
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &str;

    /// Generate a reply, invoking `on_text` with each text delta as it arrives
    async fn generate(
        &self,
        request: GenerationRequest,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> AIServiceResult<Generation>;

    /// Cost of `usage` in USD; zero when no pricing is known
    fn cost_usd(&self, _usage: Usage) -> f64 {
        0.0
    }
}
