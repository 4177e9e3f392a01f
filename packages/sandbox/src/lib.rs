// ABOUTME: Sandboxed execution subsystem: command validation/execution and session container lifecycle
// ABOUTME: Exposes the runtime primitives (breaker, ports, retry, log demux, readiness) and the container service

pub mod circuit_breaker;
pub mod command;
pub mod container;
pub mod error;
pub mod log_demux;
pub mod ports;
pub mod providers;
pub mod readiness;
pub mod retry;
pub mod workspace;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use command::{validate_command, CommandExecutor, CommandOutput, RejectReason};
pub use container::{ContainerInfo, ContainerService, ContainerStatus};
pub use error::{Result, SandboxError};
pub use log_demux::{LogDemuxer, LogLevel, LogRecord, LogStream};
pub use ports::PortManager;
pub use providers::{ContainerRuntime, DockerRuntime, ProviderError};
pub use readiness::ReadinessPoller;
pub use retry::{ConflictRetrier, ConflictStatus};
pub use workspace::{validate_session_id, SandboxWorkspace, WorkspaceError};
