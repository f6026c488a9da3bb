use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the keeper supervisor
#[derive(Debug, Error)]
pub enum KeeperError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    // Process-related errors
    #[error("Failed to spawn process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already running: {0}")]
    ProcessAlreadyExists(String),

    #[error("Process {0} is already stopped")]
    AlreadyStopped(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    /// Error relayed from the daemon, keeping the class it was raised with
    #[error("{message}")]
    Remote { class: ErrorClass, message: String },

    // State store errors
    #[error("Failed to load state: {0}")]
    StateLoadError(String),

    #[error("Failed to save state: {0}")]
    StateSaveError(String),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    #[error("State store error: {0}")]
    StateError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Log rotation failed: {0}")]
    LogRotationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse failure class, carried over IPC and mapped to CLI exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Config,
    NotFound,
    AlreadyStopped,
    AlreadyExists,
    Runtime,
}

impl KeeperError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KeeperError::Config(_)
            | KeeperError::InvalidConfig(_)
            | KeeperError::MissingConfigField(_) => ErrorClass::Config,
            KeeperError::ProcessNotFound(_) => ErrorClass::NotFound,
            KeeperError::AlreadyStopped(_) => ErrorClass::AlreadyStopped,
            KeeperError::ProcessAlreadyExists(_) => ErrorClass::AlreadyExists,
            KeeperError::Remote { class, .. } => *class,
            _ => ErrorClass::Runtime,
        }
    }

    /// A spawn failure that retrying cannot fix: the executable is gone
    pub fn is_irrecoverable_spawn(&self) -> bool {
        matches!(
            self,
            KeeperError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Result type alias for keeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_share_a_class() {
        assert_eq!(KeeperError::Config("x".into()).class(), ErrorClass::Config);
        assert_eq!(
            KeeperError::InvalidConfig("x".into()).class(),
            ErrorClass::Config
        );
        assert_eq!(
            KeeperError::MissingConfigField("name".into()).class(),
            ErrorClass::Config
        );
    }

    #[test]
    fn test_remote_error_keeps_class() {
        let err = KeeperError::Remote {
            class: ErrorClass::AlreadyStopped,
            message: "api is already stopped".into(),
        };
        assert_eq!(err.class(), ErrorClass::AlreadyStopped);
        assert_eq!(err.to_string(), "api is already stopped");
    }

    #[test]
    fn test_spawn_not_found_is_irrecoverable() {
        let missing = KeeperError::Spawn {
            name: "api".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let denied = KeeperError::Spawn {
            name: "api".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(missing.is_irrecoverable_spawn());
        assert!(!denied.is_irrecoverable_spawn());
        assert_eq!(denied.class(), ErrorClass::Runtime);
    }
}
