use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Value out of range: {0}")]
    NotInRange(String),
    #[error("Missing value: {0}")]
    Missing(String),
    #[error("Directory error: {0}")]
    DirectoryDoesNotExist(String),
}

/// Errors surfaced by the alert and deployment repositories.
///
/// Backend errors are logged where they happen and collapsed into these
/// variants so `sea_orm::DbErr` never crosses the repository boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage connection failed")]
    ConnectionFailed,
    #[error("Storage write failed")]
    WriteFailed,
    #[error("Storage read failed")]
    ReadFailed,
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Conflicting record: {0}")]
    Conflict(String),
    #[error("Record {0} is terminal and can no longer be modified")]
    Immutable(Uuid),
}

/// Errors reported by an external backend (log source, git, remote shell).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    /// Timeouts, throttling, hiccups: worth retrying.
    #[error("transient external error: {0}")]
    Transient(String),
    /// Anything retrying will not fix.
    #[error("external error: {0}")]
    Fatal(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Invalid alert payload: {0}")]
    Validation(String),
    #[error("Alert not found: {0}")]
    NotFound(Uuid),
    #[error("Alert storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Invalid tail request: {0}")]
    Validation(String),
    #[error("A tail session is already running for {0}")]
    AlreadyRunning(String),
    #[error("No tail session running for {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid deployment request: {0}")]
    Validation(String),
    #[error("Deployment {0} is already in progress")]
    InProgress(Uuid),
    #[error("Deployment not found: {0}")]
    NotFound(Uuid),
    #[error("Deployment storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Deployment backend error: {0}")]
    External(#[from] ExternalError),
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("Invalid bind address: {0}")]
    BadBindAddress(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Web error: {0}")]
    Web(#[from] WebError),
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_flagged() {
        assert!(ExternalError::Transient("throttled".into()).is_transient());
        assert!(!ExternalError::Fatal("no such log group".into()).is_transient());
    }

    #[test]
    fn storage_errors_wrap_into_component_errors() {
        let err: DeployError = StorageError::WriteFailed.into();
        assert_eq!(err.to_string(), "Deployment storage error: Storage write failed");
        let err: AlertError = StorageError::ReadFailed.into();
        assert!(matches!(err, AlertError::Storage(StorageError::ReadFailed)));
    }
}
