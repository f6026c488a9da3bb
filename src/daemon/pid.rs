// PID file management for daemon process

use crate::error::{KeeperError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Manages the daemon PID file
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Write the current process PID to the file
    pub fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KeeperError::StateError(format!("Failed to create PID directory: {}", e)))?;
        }
        fs::write(&self.path, std::process::id().to_string())
            .map_err(|e| KeeperError::StateError(format!("Failed to write PID file: {}", e)))
    }

    pub fn read(&self) -> Result<u32> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| KeeperError::StateError(format!("Failed to read PID file: {}", e)))?;

        content
            .trim()
            .parse::<u32>()
            .map_err(|e| KeeperError::StateError(format!("Invalid PID in file: {}", e)))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| KeeperError::StateError(format!("Failed to remove PID file: {}", e)))?;
        }
        Ok(())
    }

    /// PID of a live daemon, if the file names one
    pub fn live_pid(&self) -> Option<u32> {
        if !self.exists() {
            return None;
        }
        self.read().ok().filter(|pid| is_process_alive(*pid))
    }

    pub fn is_daemon_running(&self) -> bool {
        self.live_pid().is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Probe with the null signal
#[cfg(unix)]
pub(crate) fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn is_process_alive(_pid: u32) -> bool {
    true
}
