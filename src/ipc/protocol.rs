// IPC Protocol definitions for client-daemon communication

use crate::error::{ErrorClass, KeeperError};
use crate::process::types::HealthSnapshot;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon management commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonCommand {
    Status,
    Stop,
}

/// All available commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Load a config file (absolute path) and start every record in it
    StartFromConfig { config_path: PathBuf },
    /// Graceful stop; `None` uses the record's own grace timeout
    Stop {
        name: String,
        timeout_ms: Option<u64>,
    },
    Restart { name: String },
    /// One instance by name, or every instance
    Status { name: Option<String> },
    Daemon(DaemonCommand),
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Started { names: Vec<String> },
    Stopped(HealthSnapshot),
    Restarted(HealthSnapshot),
    Status(Vec<HealthSnapshot>),
    DaemonStatus {
        pid: u32,
        uptime: Duration,
        instances: usize,
        /// Drain deadline the daemon was started with
        shutdown_timeout: Duration,
    },
    /// Generic success message
    Success(String),
}

/// Error payload carried back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&KeeperError> for ErrorReply {
    fn from(error: &KeeperError) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
        }
    }
}

impl From<ErrorReply> for KeeperError {
    fn from(reply: ErrorReply) -> Self {
        KeeperError::Remote {
            class: reply.class,
            message: reply.message,
        }
    }
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorReply>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: &KeeperError) -> Self {
        Self {
            id,
            result: Err(ErrorReply::from(error)),
        }
    }

    /// Convert into a library result, mapping remote errors back to `KeeperError`
    pub fn into_result(self) -> crate::error::Result<ResponseData> {
        self.result.map_err(KeeperError::from)
    }
}
