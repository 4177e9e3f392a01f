// ABOUTME: Generation pipeline: turns a prompt into a running full-stack app inside a session sandbox
// ABOUTME: Capabilities run in a fixed order under the orchestrator, reporting through the message tracker

pub mod capabilities;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod messages;
pub mod orchestrator;
pub mod services;

pub use capabilities::{Capability, ReplySegment};
pub use context::{CapabilityContext, CapabilityResult, ContextUpdate, PipelineConfig, Stage};
pub use diagnostics::{categorize, format_for_model, parse, DiagnosticCategory, DiagnosticError};
pub use error::{PipelineError, Result};
pub use events::{EventHub, LiveEvent};
pub use messages::MessageTracker;
pub use orchestrator::Orchestrator;
pub use services::PipelineServices;
