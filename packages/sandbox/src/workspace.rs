// ABOUTME: Per-session sandbox directories on the local filesystem
// ABOUTME: Validates session ids and confines every file access to the session's sandbox root

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Invalid session ID '{session_id}': {reason}")]
    InvalidSessionId { session_id: String, reason: String },

    #[error("Path escapes the sandbox: {0}")]
    PathOutsideSandbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Validate a session ID so it is safe to use as a directory and container name.
///
/// Session IDs must be non-empty and contain only ASCII alphanumerics, hyphens and
/// underscores. Anything else (separators, `..`, whitespace) is refused.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(WorkspaceError::InvalidSessionId {
            session_id: session_id.to_string(),
            reason: "Session ID cannot be empty".to_string(),
        });
    }

    if session_id.len() > 128 {
        return Err(WorkspaceError::InvalidSessionId {
            session_id: session_id.to_string(),
            reason: "Session ID cannot exceed 128 characters".to_string(),
        });
    }

    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkspaceError::InvalidSessionId {
            session_id: session_id.to_string(),
            reason: "Session ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Filesystem collaborator that owns one directory per session under a common root
#[derive(Debug, Clone)]
pub struct SandboxWorkspace {
    root: PathBuf,
}

impl SandboxWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute-or-root-relative directory for a session; does not touch the disk
    pub fn sandbox_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    /// Create the session directory if it does not exist yet
    pub async fn initialize(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.sandbox_path(session_id)?;
        fs::create_dir_all(&path).await?;
        info!(session_id = %session_id, path = %path.display(), "Initialized sandbox");
        Ok(path)
    }

    /// Resolve a sandbox-relative path, refusing absolute paths and `..` segments
    pub fn resolve(&self, session_id: &str, relative: &str) -> Result<PathBuf> {
        let base = self.sandbox_path(session_id)?;
        let candidate = Path::new(relative);

        if relative.trim().is_empty() {
            return Err(WorkspaceError::PathOutsideSandbox(relative.to_string()));
        }

        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::PathOutsideSandbox(relative.to_string()));
                }
            }
        }

        Ok(base.join(candidate))
    }

    pub async fn write_file(&self, session_id: &str, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve(session_id, relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        debug!(session_id = %session_id, file = %relative, bytes = content.len(), "Wrote sandbox file");
        Ok(())
    }

    pub async fn read_file(&self, session_id: &str, relative: &str) -> Result<String> {
        let path = self.resolve(session_id, relative)?;
        Ok(fs::read_to_string(&path).await?)
    }

    /// Delete the session directory; removing a missing sandbox is not an error
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.sandbox_path(session_id)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(session_id = %session_id, "Removed sandbox");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
