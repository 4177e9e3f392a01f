// ABOUTME: Container runtime trait and shared types for session container backends
// ABOUTME: Defines the lifecycle surface the container service drives and the runtime error type

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

use crate::retry::ConflictStatus;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Runtime API error ({status_code}): {message}")]
    Api { status_code: u16, message: String },

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Log stream error: {0}")]
    StreamError(String),
}

impl ProviderError {
    /// HTTP status reported by the runtime daemon, when there was one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl ConflictStatus for ProviderError {
    fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Everything needed to create one session container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// A container as reported by the runtime when listing by label
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
}

/// Raw multiplexed log bytes: 8-byte frame headers followed by payloads
pub type LogByteStream = BoxStream<'static, Result<Bytes>>;

/// Lifecycle operations of a Docker-API-compatible container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image from its registry
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container without starting it, returning its ID
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Follow the container's stdout/stderr as a framed byte stream
    async fn attach_logs(&self, container_id: &str) -> Result<LogByteStream>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// List containers (running or not) carrying `label` (`key=value`)
    async fn list_containers(&self, label: &str) -> Result<Vec<RuntimeContainer>>;
}
