use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitgovError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Project not initialized: {0}")]
    Uninitialized(String),
    /// Checksum or signature mismatch. Never corrected silently.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("Schema violation: {0}")]
    SchemaViolation(String),
    #[error("Referential violation: {0}")]
    ReferentialViolation(String),
    /// Divergent state-branch histories, or a rebase waiting on `resolve`.
    #[error("Sync conflict: {0}")]
    SyncConflict(String),
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),
    #[error("git timed out after {secs}s: {command}")]
    GitTimeout { command: String, secs: u64 },
    #[error("git error: {0}")]
    Git(String),
    #[error("No private key available for actor {0}")]
    KeyUnavailable(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl GitgovError {
    /// Transient failures are retried up to a bounded attempt count.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitgovError::TransientIo(_) | GitgovError::GitTimeout { .. }
        )
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            GitgovError::IntegrityViolation(_) => {
                Some("Run `gitgov lint --fix` to recompute checksums and re-sign affected records.")
            }
            GitgovError::SyncConflict(_) => Some(
                "Edit the conflicting records, then run `gitgov sync resolve` before pushing or pulling again.",
            ),
            GitgovError::Uninitialized(_) => {
                Some("Initialize the project or bootstrap it from the state branch.")
            }
            GitgovError::KeyUnavailable(_) => {
                Some("Store the actor's private key under .gitgov/keys/ or set GITGOV_ACTOR.")
            }
            GitgovError::TransientIo(_) | GitgovError::GitTimeout { .. } => {
                Some("Check network connectivity and retry.")
            }
            _ => None,
        }
    }
}
