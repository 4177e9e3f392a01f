// ABOUTME: Model client used by the generation pipeline
// ABOUTME: Anthropic streaming client, the ModelClient seam, and token/cost accounting

pub mod client;
pub mod service;
pub mod usage;

pub use client::{Generation, GenerationRequest, ModelClient};
pub use service::{AIService, AIServiceError, AIServiceResult};
pub use usage::{Pricing, Usage};
