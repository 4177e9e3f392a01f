// ABOUTME: AI service for text generation calls to Anthropic Claude
// ABOUTME: Handles API requests, SSE stream parsing, and usage tracking

use std::env;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use sandcastle_config::constants::{ANTHROPIC_API_KEY, ANTHROPIC_MODEL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::client::{Generation, GenerationRequest, ModelClient};
use crate::usage::{Pricing, Usage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum AIServiceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No API key configured")]
    NoApiKey,

    #[error("Invalid response format")]
    InvalidResponse,
}

pub type AIServiceResult<T> = Result<T, AIServiceError>;

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

/// One decoded server-sent event from a streaming call
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Usage(Usage),
}

/// Decode the JSON payload of one `data:` line; uninteresting events yield `None`
pub fn parse_stream_data(data: &str) -> Option<AIServiceResult<StreamEvent>> {
    let event: serde_json::Value = serde_json::from_str(data).ok()?;
    match event["type"].as_str()? {
        "content_block_delta" => event["delta"]["text"]
            .as_str()
            .map(|text| Ok(StreamEvent::Text(text.to_string()))),
        "message_start" => {
            let usage = &event["message"]["usage"];
            Some(Ok(StreamEvent::Usage(Usage {
                input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
            })))
        }
        "message_delta" => event["usage"]["output_tokens"].as_u64().map(|output| {
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 0,
                output_tokens: output as u32,
            }))
        }),
        "error" => {
            let message = event["error"]["message"]
                .as_str()
                .unwrap_or("Unknown streaming error");
            Some(Err(AIServiceError::ApiError(message.to_string())))
        }
        _ => None,
    }
}

/// AI service for text generation calls
pub struct AIService {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    pricing: Option<Pricing>,
}

impl AIService {
    /// Create HTTP client with timeout configuration
    fn create_client() -> Client {
        Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build configured HTTP client, using defaults: {}", e);
                Client::new()
            })
    }

    /// Creates a new AI service instance
    /// API key is fetched from ANTHROPIC_API_KEY environment variable
    /// Model can be overridden with ANTHROPIC_MODEL environment variable
    pub fn new() -> Self {
        let api_key = env::var(ANTHROPIC_API_KEY).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            info!("{} not set - generation calls will fail", ANTHROPIC_API_KEY);
        }

        let model = env::var(ANTHROPIC_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        if model != DEFAULT_MODEL {
            info!("Using custom Anthropic model: {}", model);
        }

        Self {
            client: Self::create_client(),
            api_key,
            model,
            base_url: ANTHROPIC_API_URL.to_string(),
            pricing: None,
        }
    }

    /// Creates a new AI service instance with a specific API key and model
    pub fn with_api_key_and_model(api_key: String, model: String) -> Self {
        Self {
            client: Self::create_client(),
            api_key: Some(api_key),
            model,
            base_url: ANTHROPIC_API_URL.to_string(),
            pricing: None,
        }
    }

    /// Point the service at a different API host (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_request(&self, request: GenerationRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: DEFAULT_TEMPERATURE,
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt,
            }],
            system: request.system,
            stream: true,
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> AIServiceResult<reqwest::Response> {
        let api_key = self.api_key.as_ref().ok_or(AIServiceError::NoApiKey)?;

        info!(
            "Making Anthropic API request: model={}, max_tokens={}",
            body.model, body.max_tokens
        );

        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("Anthropic API request timed out");
                    AIServiceError::ApiError("Request timed out. The AI service may be overloaded or unavailable.".to_string())
                } else if e.is_connect() {
                    error!("Failed to connect to Anthropic API: {}", e);
                    AIServiceError::ApiError(format!("Connection failed: {}", e))
                } else {
                    error!("Anthropic API request failed: {}", e);
                    AIServiceError::RequestFailed(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Anthropic API error: {} - {}", status, error_text);
            return Err(AIServiceError::ApiError(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }

    /// Makes a streaming text generation call to Claude
    /// Returns a stream of text deltas and usage updates as they arrive
    pub async fn generate_text_stream(
        &self,
        request: GenerationRequest,
    ) -> AIServiceResult<impl Stream<Item = AIServiceResult<StreamEvent>>> {
        let body = self.build_request(request);
        let response = self.send(&body).await?;

        let stream = async_stream::stream! {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        // Process complete SSE events
                        while let Some(event_end) = buffer.find("\n\n") {
                            let event = buffer[..event_end].to_string();
                            buffer.drain(..event_end + 2);

                            for line in event.lines() {
                                let Some(data) = line.strip_prefix("data:") else {
                                    continue;
                                };
                                match parse_stream_data(data.trim_start()) {
                                    Some(Ok(event)) => yield Ok(event),
                                    Some(Err(e)) => {
                                        yield Err(e);
                                        return;
                                    }
                                    None => {}
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(AIServiceError::RequestFailed(e));
                        return;
                    }
                }
            }
        };

        Ok(stream)
    }
}

impl Default for AIService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for AIService {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> AIServiceResult<Generation> {
        let stream = self.generate_text_stream(request).await?;
        futures::pin_mut!(stream);

        let mut generation = Generation::default();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Text(delta) => {
                    on_text(&delta);
                    generation.text.push_str(&delta);
                }
                StreamEvent::Usage(usage) => {
                    // message_delta reports a running output total
                    generation.usage.input_tokens =
                        generation.usage.input_tokens.max(usage.input_tokens);
                    generation.usage.output_tokens =
                        generation.usage.output_tokens.max(usage.output_tokens);
                }
            }
        }

        debug!(
            "Generation finished: {} chars, {} input / {} output tokens",
            generation.text.len(),
            generation.usage.input_tokens,
            generation.usage.output_tokens
        );
        Ok(generation)
    }

    fn cost_usd(&self, usage: Usage) -> f64 {
        self.pricing.map(|p| p.cost_usd(usage)).unwrap_or(0.0)
    }
}
