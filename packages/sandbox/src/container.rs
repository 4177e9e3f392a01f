// ABOUTME: Per-session container lifecycle built on the runtime primitives
// ABOUTME: Reserves ports atomically, starts containers behind the breaker and retrier, buffers logs, and cleans up orphans

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{Result, SandboxError};
use crate::log_demux::{LogDemuxer, LogLevel, LogRecord};
use crate::ports::PortManager;
use crate::providers::{
    ContainerRuntime, ContainerSpec, LogByteStream, PortMapping, ProviderError, VolumeMount,
};
use crate::readiness::ReadinessPoller;
use crate::retry::ConflictRetrier;
use crate::workspace::{validate_session_id, SandboxWorkspace};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sandcastle_config::Config;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CONTAINER_NAME_PREFIX: &str = "sandcastle-";
pub const MANAGED_LABEL: &str = "sandcastle.managed";
pub const SESSION_LABEL: &str = "sandcastle.session";
pub const CLIENT_CONTAINER_PORT: u16 = 5173;
pub const SERVER_CONTAINER_PORT: u16 = 3000;
pub const LOG_BUFFER_CAPACITY: usize = 500;

const STOP_TIMEOUT_SECS: u64 = 10;
const SANDBOX_MOUNT: &str = "/app";
const STARTUP_COMMAND: &str = "npm run setup && npm run dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub session_id: String,
    pub container_id: Option<String>,
    pub client_port: u16,
    pub server_port: u16,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Bounded ring of the most recent log records for one session
#[derive(Debug, Default)]
struct LogBuffer {
    records: Mutex<VecDeque<LogRecord>>,
}

impl LogBuffer {
    fn push(&self, record: LogRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= LOG_BUFFER_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn snapshot(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

struct ContainerEntry {
    info: ContainerInfo,
    logs: Arc<LogBuffer>,
    log_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Owns every session container started by this process
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
    workspace: SandboxWorkspace,
    breaker: CircuitBreaker,
    ports: PortManager,
    retrier: ConflictRetrier,
    readiness: ReadinessPoller,
    image: String,
    image_ready: OnceCell<()>,
    containers: RwLock<HashMap<String, ContainerEntry>>,
}

impl ContainerService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        workspace: SandboxWorkspace,
        config: &Config,
    ) -> Self {
        Self {
            runtime,
            workspace,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            ports: PortManager::new(config.ports),
            retrier: ConflictRetrier::new(config.retry.clone()),
            readiness: ReadinessPoller::new(config.readiness.clone()),
            image: config.runtime_image.clone(),
            image_ready: OnceCell::new(),
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Build the service and stop any containers left behind by a previous process
    pub async fn initialize(
        runtime: Arc<dyn ContainerRuntime>,
        workspace: SandboxWorkspace,
        config: &Config,
    ) -> Result<Self> {
        let service = Self::new(runtime, workspace, config);
        let removed = service.cleanup_orphaned_containers().await?;
        info!("Container service ready ({} orphaned containers removed)", removed);
        Ok(service)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn container_name(session_id: &str) -> String {
        format!("{}{}", CONTAINER_NAME_PREFIX, session_id)
    }

    /// Stop and remove labelled containers that this process does not track
    pub async fn cleanup_orphaned_containers(&self) -> Result<usize> {
        let label = format!("{}=true", MANAGED_LABEL);
        let found = self.runtime.list_containers(&label).await?;

        let tracked: HashSet<String> = self
            .containers
            .read()
            .await
            .values()
            .filter_map(|e| e.info.container_id.clone())
            .collect();

        let mut removed = 0;
        for container in found {
            if !container.name.starts_with(CONTAINER_NAME_PREFIX) || tracked.contains(&container.id)
            {
                continue;
            }

            warn!(
                "Found orphaned container: {} (name: {})",
                container.id, container.name
            );
            if let Err(e) = self
                .runtime
                .stop_container(&container.id, STOP_TIMEOUT_SECS)
                .await
            {
                debug!("Stopping orphan {} failed: {}", container.id, e);
            }
            match self.runtime.remove_container(&container.id, true).await {
                Ok(()) => {
                    info!("Removed orphaned container: {}", container.id);
                    removed += 1;
                }
                Err(e) => error!("Failed to remove orphaned container {}: {}", container.id, e),
            }
        }

        Ok(removed)
    }

    /// Start (or return) the container for a session and wait until it answers HTTP.
    ///
    /// Port reservation happens under the registry lock together with inserting a
    /// `creating` entry, so concurrent starts never receive overlapping ports.
    pub async fn start(&self, session_id: &str, cancel: &CancellationToken) -> Result<ContainerInfo> {
        validate_session_id(session_id)?;
        self.breaker.check()?;

        let (client_port, server_port, entry_cancel) = {
            let mut containers = self.containers.write().await;
            if let Some(existing) = containers.get(session_id).map(|e| e.info.clone()) {
                match existing.status {
                    ContainerStatus::Creating
                    | ContainerStatus::Running
                    | ContainerStatus::Stopping => return Ok(existing),
                    ContainerStatus::Stopped | ContainerStatus::Error => {
                        debug!(session_id = %session_id, "Replacing previous failed container entry");
                        containers.remove(session_id);
                    }
                }
            }

            let in_use: HashSet<u16> = containers
                .values()
                .flat_map(|e| [e.info.client_port, e.info.server_port])
                .collect();
            let (client_port, server_port) = self.ports.find_two_available_ports(&in_use)?;

            let entry_cancel = cancel.child_token();
            containers.insert(
                session_id.to_string(),
                ContainerEntry {
                    info: ContainerInfo {
                        session_id: session_id.to_string(),
                        container_id: None,
                        client_port,
                        server_port,
                        status: ContainerStatus::Creating,
                        error: None,
                        created_at: Utc::now(),
                    },
                    logs: Arc::new(LogBuffer::default()),
                    log_task: None,
                    cancel: entry_cancel.clone(),
                },
            );
            (client_port, server_port, entry_cancel)
        };

        info!(
            session_id = %session_id,
            client_port = client_port,
            server_port = server_port,
            "Starting session container"
        );

        match self
            .launch(session_id, client_port, server_port, &entry_cancel)
            .await
        {
            Ok(()) => self.mark_running(session_id).await,
            Err(e) => Err(self.fail_start(session_id, e).await),
        }
    }

    async fn launch(
        &self,
        session_id: &str,
        client_port: u16,
        server_port: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_image().await?;
        let sandbox = self.workspace.initialize(session_id).await?;
        let spec = self.container_spec(session_id, &sandbox, client_port, server_port);

        let container_id = self
            .retrier
            .retry("create container", || self.runtime.create_container(&spec))
            .await?;
        if !self.record_container_id(session_id, &container_id).await {
            // Stopped while we were creating; nobody else knows this container
            self.remove_quietly(&container_id).await;
            return Err(SandboxError::Cancelled);
        }

        self.retrier
            .retry("start container", || self.runtime.start_container(&container_id))
            .await?;

        let stream = self.runtime.attach_logs(&container_id).await?;
        self.attach_log_pump(session_id, stream).await;

        self.readiness.wait_for_port(client_port, cancel).await?;
        Ok(())
    }

    async fn ensure_image(&self) -> Result<()> {
        self.image_ready
            .get_or_try_init(|| async {
                if self.runtime.image_exists(&self.image).await? {
                    debug!("Runtime image {} already present", self.image);
                } else {
                    info!("Runtime image {} missing, pulling", self.image);
                    self.runtime.pull_image(&self.image).await?;
                }
                Ok::<(), ProviderError>(())
            })
            .await?;
        Ok(())
    }

    fn container_spec(
        &self,
        session_id: &str,
        sandbox: &Path,
        client_port: u16,
        server_port: u16,
    ) -> ContainerSpec {
        let host_path = std::fs::canonicalize(sandbox)
            .unwrap_or_else(|_| sandbox.to_path_buf())
            .to_string_lossy()
            .to_string();

        ContainerSpec {
            image: self.image.clone(),
            name: Self::container_name(session_id),
            env_vars: HashMap::from([
                ("CLIENT_PORT".to_string(), client_port.to_string()),
                ("SERVER_PORT".to_string(), server_port.to_string()),
                ("NODE_ENV".to_string(), "development".to_string()),
            ]),
            volumes: vec![VolumeMount {
                host_path,
                container_path: SANDBOX_MOUNT.to_string(),
                readonly: false,
            }],
            ports: vec![
                PortMapping {
                    host_port: client_port,
                    container_port: CLIENT_CONTAINER_PORT,
                },
                PortMapping {
                    host_port: server_port,
                    container_port: SERVER_CONTAINER_PORT,
                },
            ],
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                STARTUP_COMMAND.to_string(),
            ]),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (SESSION_LABEL.to_string(), session_id.to_string()),
            ]),
        }
    }

    async fn record_container_id(&self, session_id: &str, container_id: &str) -> bool {
        let mut containers = self.containers.write().await;
        match containers.get_mut(session_id) {
            Some(entry) if entry.info.status == ContainerStatus::Creating => {
                entry.info.container_id = Some(container_id.to_string());
                true
            }
            _ => false,
        }
    }

    async fn attach_log_pump(&self, session_id: &str, stream: LogByteStream) {
        let mut containers = self.containers.write().await;
        if let Some(entry) = containers.get_mut(session_id) {
            let task = spawn_log_pump(session_id.to_string(), stream, Arc::clone(&entry.logs));
            entry.log_task = Some(task);
        }
    }

    async fn mark_running(&self, session_id: &str) -> Result<ContainerInfo> {
        let mut containers = self.containers.write().await;
        match containers.get_mut(session_id) {
            Some(entry) if entry.info.status == ContainerStatus::Creating => {
                entry.info.status = ContainerStatus::Running;
                self.breaker.record_success();
                info!(
                    session_id = %session_id,
                    client_port = entry.info.client_port,
                    "Session container running"
                );
                Ok(entry.info.clone())
            }
            // stop() won the race; it owns the teardown
            _ => Err(SandboxError::Cancelled),
        }
    }

    /// Record the failure, tear down what was created and leave an `error` entry
    ///
    /// When `stop()` already took the entry over, the failure is a consequence of
    /// that teardown and does not count against the breaker.
    async fn fail_start(&self, session_id: &str, err: SandboxError) -> SandboxError {
        let (still_creating, container_id) = {
            let mut containers = self.containers.write().await;
            match containers.get_mut(session_id) {
                Some(entry) if entry.info.status == ContainerStatus::Creating => {
                    if let Some(task) = entry.log_task.take() {
                        task.abort();
                    }
                    entry.info.status = ContainerStatus::Error;
                    entry.info.error = Some(err.to_string());
                    (true, entry.info.container_id.clone())
                }
                _ => (false, None),
            }
        };

        if still_creating && !matches!(err, SandboxError::Cancelled) {
            self.breaker.record_failure();
        }

        if let Some(id) = container_id {
            self.remove_quietly(&id).await;
        }

        error!(session_id = %session_id, "Failed to start session container: {}", err);
        match err {
            SandboxError::ReadinessTimeout { .. }
            | SandboxError::CircuitOpen
            | SandboxError::PortExhausted { .. }
            | SandboxError::Cancelled
            | SandboxError::ContainerStartFailed { .. } => err,
            other => SandboxError::ContainerStartFailed {
                session_id: session_id.to_string(),
                message: other.to_string(),
            },
        }
    }

    async fn remove_quietly(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("Best-effort removal of container {} failed: {}", container_id, e);
        }
    }

    /// Tear down a session's container and release its ports
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let (container_id, log_task) = {
            let mut containers = self.containers.write().await;
            let entry = containers
                .get_mut(session_id)
                .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;
            if entry.info.status == ContainerStatus::Stopping {
                return Ok(());
            }
            entry.info.status = ContainerStatus::Stopping;
            entry.cancel.cancel();
            (entry.info.container_id.clone(), entry.log_task.take())
        };

        info!(session_id = %session_id, "Stopping session container");
        if let Some(task) = log_task {
            task.abort();
        }

        let result = match &container_id {
            Some(id) => self.teardown(id).await,
            None => Ok(()),
        };

        // Ports are released only once the container is gone (or could not be found)
        self.containers.write().await.remove(session_id);
        info!(session_id = %session_id, "Session container stopped");
        result
    }

    async fn teardown(&self, container_id: &str) -> Result<()> {
        if let Err(e) = self
            .runtime
            .stop_container(container_id, STOP_TIMEOUT_SECS)
            .await
        {
            warn!("Failed to stop container {}: {}", container_id, e);
        }
        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.status_code() == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<ContainerInfo> {
        self.containers
            .read()
            .await
            .get(session_id)
            .map(|e| e.info.clone())
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))
    }

    /// Most recent log records (oldest first) for a session
    pub async fn logs(&self, session_id: &str) -> Result<Vec<LogRecord>> {
        self.containers
            .read()
            .await
            .get(session_id)
            .map(|e| e.logs.snapshot())
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list(&self) -> Vec<ContainerInfo> {
        let mut infos: Vec<ContainerInfo> = self
            .containers
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Stop every tracked container and cancel the breaker's pending reset
    pub async fn shutdown(&self) {
        let sessions: Vec<String> = self.containers.read().await.keys().cloned().collect();
        info!("Shutting down {} session containers", sessions.len());
        for session_id in sessions {
            if let Err(e) = self.stop(&session_id).await {
                warn!(session_id = %session_id, "Failed to stop container during shutdown: {}", e);
            }
        }
        self.breaker.cleanup();
    }
}

fn spawn_log_pump(
    session_id: String,
    mut stream: LogByteStream,
    buffer: Arc<LogBuffer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut demux = LogDemuxer::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for record in demux.push(&bytes) {
                        emit_log(&session_id, &record);
                        buffer.push(record);
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, "Container log stream failed: {}", e);
                    break;
                }
            }
        }
        debug!(session_id = %session_id, "Container log stream ended");
    })
}

fn emit_log(session_id: &str, record: &LogRecord) {
    match record.level {
        LogLevel::Error => {
            error!(target: "sandcastle::container", session_id = %session_id, stream = ?record.stream, "{}", record.message)
        }
        LogLevel::Warn => {
            warn!(target: "sandcastle::container", session_id = %session_id, stream = ?record.stream, "{}", record.message)
        }
        LogLevel::Info => {
            info!(target: "sandcastle::container", session_id = %session_id, stream = ?record.stream, "{}", record.message)
        }
    }
}
