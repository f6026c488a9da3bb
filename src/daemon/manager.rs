// Daemon lifecycle management from outside the daemon process

use super::pid::PidFile;
use crate::config::RuntimePaths;
use crate::error::{KeeperError, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_SETTLE_TIME: Duration = Duration::from_secs(1);

/// How `stop_daemon` brought the daemon down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Graceful,
    Forced,
}

/// Daemon manager for controlling daemon lifecycle
#[derive(Debug, Clone)]
pub struct DaemonManager {
    pid_file: PidFile,
}

impl DaemonManager {
    pub fn new(paths: &RuntimePaths) -> Self {
        Self::with_pid_file(PidFile::new(paths.pid_file()))
    }

    pub fn with_pid_file(pid_file: PidFile) -> Self {
        Self { pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.pid_file.is_daemon_running()
    }

    pub fn get_pid(&self) -> Option<u32> {
        self.pid_file.live_pid()
    }

    /// Claim the PID file for the current process (called from within the daemon)
    pub fn register_daemon(&self) -> Result<()> {
        if let Some(pid) = self.get_pid() {
            if pid != std::process::id() {
                return Err(KeeperError::DaemonAlreadyRunning);
            }
        }

        // Stale file from a daemon that died without cleaning up
        self.pid_file.remove()?;
        self.pid_file.write()
    }

    pub fn unregister_daemon(&self) -> Result<()> {
        self.pid_file.remove()
    }

    /// Send SIGTERM, wait up to `timeout`, then escalate to SIGKILL
    #[cfg(unix)]
    pub fn stop_daemon(&self, timeout: Duration) -> Result<StopMode> {
        let pid = self.get_pid().ok_or(KeeperError::DaemonNotRunning)?;
        let target = Pid::from_raw(pid as i32);

        kill(target, Signal::SIGTERM)
            .map_err(|e| KeeperError::SignalError(format!("Failed to send SIGTERM: {}", e)))?;

        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_running() {
                self.pid_file.remove()?;
                return Ok(StopMode::Graceful);
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        kill(target, Signal::SIGKILL)
            .map_err(|e| KeeperError::SignalError(format!("Failed to send SIGKILL: {}", e)))?;
        std::thread::sleep(KILL_SETTLE_TIME);

        if self.is_running() {
            return Err(KeeperError::StopError(
                format!("daemon (PID {})", pid),
                "still alive after SIGKILL".to_string(),
            ));
        }

        self.pid_file.remove()?;
        Ok(StopMode::Forced)
    }

    #[cfg(not(unix))]
    pub fn stop_daemon(&self, _timeout: Duration) -> Result<StopMode> {
        Err(KeeperError::Other(
            "Daemon stop is only supported on Unix systems".to_string(),
        ))
    }

    pub fn get_status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: self.get_pid(),
            pid_file: self.pid_file.path().to_path_buf(),
        }
    }
}

/// Daemon status as seen from the PID file
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}

impl DaemonStatus {
    pub fn running(&self) -> bool {
        self.pid.is_some()
    }
}
