use crate::config::ExecMode;
use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant, SystemTime};

/// Opaque id for a supervised instance, returned by `Supervisor::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(pub u64);

impl InstanceHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of what to launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    /// Absolute path to the executable
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Absolute working directory
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub exec_mode: ExecMode,
    /// Accepted for schema compatibility; one instance is supervised
    pub instances: usize,
    /// Accepted for schema compatibility; file watching is not performed
    pub watch: bool,
    pub stop_signal: String,
    /// Grace period for policy-initiated stops
    pub kill_timeout: Duration,
}

impl ProcessSpec {
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(
        name: &str,
        executable: P1,
        cwd: P2,
    ) -> Self {
        Self {
            name: name.to_string(),
            executable: executable.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            exec_mode: ExecMode::Fork,
            instances: 1,
            watch: false,
            stop_signal: "SIGTERM".to_string(),
            kill_timeout: Duration::from_secs(5),
        }
    }

    /// Check that this process can actually be launched on this machine
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KeeperError::MissingConfigField("name".to_string()));
        }

        if self.exec_mode != ExecMode::Fork {
            return Err(KeeperError::Config(format!(
                "exec_mode '{}' is not supported; only 'fork' is",
                self.exec_mode
            )));
        }

        if self.instances == 0 {
            return Err(KeeperError::Config(
                "instances must be at least 1".to_string(),
            ));
        }

        crate::process::terminate::parse_signal(&self.stop_signal)
            .map_err(|e| KeeperError::Config(e.to_string()))?;

        let cwd_meta = std::fs::metadata(&self.cwd).map_err(|_| {
            KeeperError::Config(format!(
                "Working directory does not exist: {}",
                self.cwd.display()
            ))
        })?;
        if !cwd_meta.is_dir() {
            return Err(KeeperError::Config(format!(
                "Working directory is not a directory: {}",
                self.cwd.display()
            )));
        }

        let exe_meta = std::fs::metadata(&self.executable).map_err(|_| {
            KeeperError::Config(format!(
                "Executable does not exist: {}",
                self.executable.display()
            ))
        })?;
        if !exe_meta.is_file() {
            return Err(KeeperError::Config(format!(
                "Executable is not a regular file: {}",
                self.executable.display()
            )));
        }
        if exe_meta.permissions().mode() & 0o111 == 0 {
            return Err(KeeperError::Config(format!(
                "Executable is not executable: {}",
                self.executable.display()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// States that end the instance until an operator acts
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Restarting => write!(f, "restarting"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}

/// How a managed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    /// Exit code 0
    Clean,
    /// Non-zero exit code
    Crashed(i32),
    /// Terminated by a signal
    Signaled(i32),
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitKind::Clean,
            (Some(code), _) => ExitKind::Crashed(code),
            (None, Some(signal)) => ExitKind::Signaled(signal),
            // Neither code nor signal: treat as an abnormal exit
            (None, None) => ExitKind::Crashed(-1),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitKind::Clean)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitKind::Clean => Some(0),
            ExitKind::Crashed(code) => Some(*code),
            ExitKind::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "exited cleanly"),
            ExitKind::Crashed(code) => write!(f, "crashed with exit code {}", code),
            ExitKind::Signaled(signal) => {
                match nix::sys::signal::Signal::try_from(*signal) {
                    Ok(sig) => write!(f, "killed by {}", sig.as_str()),
                    Err(_) => write!(f, "killed by signal {}", signal),
                }
            }
        }
    }
}

/// Why a restart was scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    Exited(ExitKind),
    MemoryBreach { bytes: u64, limit: u64 },
    SpawnFailed(String),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Exited(kind) => write!(f, "process {}", kind),
            RestartReason::MemoryBreach { bytes, limit } => write!(
                f,
                "memory breach: {} bytes resident (limit {} bytes)",
                bytes, limit
            ),
            RestartReason::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
        }
    }
}

/// One resident-memory reading for a PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub pid: u32,
    pub bytes: u64,
    pub taken_at: Instant,
}

impl MemorySample {
    pub fn new(pid: u32, bytes: u64) -> Self {
        Self {
            pid,
            bytes,
            taken_at: Instant::now(),
        }
    }
}

/// Last-known observable state of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub handle: InstanceHandle,
    pub name: String,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub running: bool,
    pub memory_bytes: Option<u64>,
    pub memory_limit: Option<u64>,
    pub exit_code: Option<i32>,
    pub last_exit: Option<ExitKind>,
    pub consecutive_restarts: u32,
    pub total_restarts: u64,
    pub started_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    pub fn uptime(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        self.started_at
            .map(|started| SystemTime::now().duration_since(started).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, name: &str, mode: u32) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_validate_accepts_executable() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(&dir, "app", 0o755);
        let spec = ProcessSpec::new("app", exe, dir.path());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_executable() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("app", dir.path().join("missing"), dir.path());
        match spec.validate() {
            Err(KeeperError::Config(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_not_executable() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(&dir, "app", 0o644);
        let spec = ProcessSpec::new("app", exe, dir.path());
        match spec.validate() {
            Err(KeeperError::Config(msg)) => assert!(msg.contains("not executable")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_missing_cwd() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(&dir, "app", 0o755);
        let spec = ProcessSpec::new("app", exe, dir.path().join("nowhere"));
        assert!(matches!(spec.validate(), Err(KeeperError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_signal() {
        let dir = TempDir::new().unwrap();
        let exe = write_script(&dir, "app", 0o755);
        let mut spec = ProcessSpec::new("app", exe, dir.path());
        spec.stop_signal = "SIGBOGUS".to_string();
        assert!(matches!(spec.validate(), Err(KeeperError::Config(_))));
    }

    #[test]
    fn test_exit_kind_from_status() {
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(0)), ExitKind::Clean);
        // Raw wait status: exit code lives in the high byte
        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(3 << 8)),
            ExitKind::Crashed(3)
        );
        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(9)),
            ExitKind::Signaled(9)
        );
    }

    #[test]
    fn test_exit_kind_display() {
        assert_eq!(ExitKind::Clean.to_string(), "exited cleanly");
        assert_eq!(ExitKind::Crashed(2).to_string(), "crashed with exit code 2");
        assert_eq!(ExitKind::Signaled(9).to_string(), "killed by SIGKILL");
    }

    #[test]
    fn test_terminal_states() {
        assert!(InstanceState::Stopped.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Restarting.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
    }
}
