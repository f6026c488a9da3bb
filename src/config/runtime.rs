use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the runtime home directory
pub const HOME_ENV: &str = "KEEPER_HOME";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Filesystem locations shared by the daemon and the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    home: PathBuf,
}

impl RuntimePaths {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
        }
    }

    /// Resolve from `KEEPER_HOME`, falling back to `$TMPDIR/keeper`
    pub fn from_env() -> Self {
        match std::env::var_os(HOME_ENV) {
            Some(home) if !home.is_empty() => Self::new(home),
            _ => Self::new(std::env::temp_dir().join("keeper")),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn socket_path(&self) -> PathBuf {
        self.home.join("keeper.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("keeper.pid")
    }

    pub fn state_file(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.home.join("daemon.log")
    }

    pub fn ensure_home(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Tunables for the reconciliation loop
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How often the reconciliation loop runs
    pub poll_interval: Duration,
    /// Total time allowed to drain every instance on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}
