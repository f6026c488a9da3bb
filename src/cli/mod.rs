// CLI module - User-facing command-line interface

pub mod output;

use crate::config::{self, RuntimePaths, SupervisorSettings};
use crate::daemon::{DaemonManager, StopMode};
use crate::error::{ErrorClass, KeeperError, Result};
use crate::ipc::client::IpcClient;
use crate::ipc::protocol::{Command, DaemonCommand, ResponseData};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

const DAEMON_BINARY: &str = "keeper-daemon";
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);
const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Slack on top of the daemon's own drain deadline before SIGKILL
const DAEMON_STOP_SLACK: Duration = Duration::from_secs(5);

/// keeper - keeps a long-running process alive
#[derive(Parser, Debug)]
#[command(name = "keeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Runtime directory shared with the daemon; defaults to $KEEPER_HOME
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a config file and start every process in it
    Start {
        /// Path to a TOML or JSON config file
        config: PathBuf,
    },

    /// Gracefully stop a process
    Stop {
        name: String,

        /// Grace period before SIGKILL; defaults to the process's kill_timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Restart a process and clear its restart counter
    Restart { name: String },

    /// Show every process, or details for one
    Status { name: Option<String> },

    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon, draining every process
    Stop,
    /// Check daemon status
    Status,
}

impl Cli {
    pub fn run() -> Result<()> {
        Cli::parse().execute()
    }

    pub fn execute(&self) -> Result<()> {
        let paths = self.runtime_paths()?;
        let client = IpcClient::new(paths.socket_path());

        match &self.command {
            Commands::Start { config } => {
                let config_path = absolute(config)?;
                // Validate locally so a bad file never starts a daemon
                config::load(&config_path)?;
                ensure_daemon(&paths, &client)?;

                match client.request(Command::StartFromConfig { config_path })? {
                    ResponseData::Started { names } => output::print_started(&names),
                    other => unexpected(other)?,
                }
            }

            Commands::Stop { name, timeout_ms } => {
                let command = Command::Stop {
                    name: name.clone(),
                    timeout_ms: *timeout_ms,
                };
                match client.request(command) {
                    Ok(ResponseData::Stopped(snapshot)) => output::print_stopped(&snapshot),
                    Ok(other) => unexpected(other)?,
                    Err(e) if e.class() == ErrorClass::AlreadyStopped => {
                        output::print_info(&e.to_string())
                    }
                    Err(e) => return Err(e),
                }
            }

            Commands::Restart { name } => {
                match client.request(Command::Restart { name: name.clone() })? {
                    ResponseData::Restarted(snapshot) => output::print_restarted(&snapshot),
                    other => unexpected(other)?,
                }
            }

            Commands::Status { name } => {
                let single = name.is_some();
                match client.request(Command::Status { name: name.clone() })? {
                    ResponseData::Status(snapshots) if single => {
                        snapshots.iter().for_each(output::print_detailed_status)
                    }
                    ResponseData::Status(snapshots) => output::print_status_table(&snapshots),
                    other => unexpected(other)?,
                }
            }

            Commands::Daemon { command } => match command {
                DaemonCommands::Start => {
                    if client.is_daemon_running() {
                        output::print_info("Daemon is already running");
                    } else {
                        start_daemon(&paths, &client)?;
                    }
                }
                DaemonCommands::Stop => stop_daemon(&paths, &client)?,
                DaemonCommands::Status => {
                    if !client.is_daemon_running() {
                        output::print_info("Daemon is not running");
                        return Ok(());
                    }
                    match client.request(Command::Daemon(DaemonCommand::Status))? {
                        ResponseData::DaemonStatus {
                            pid,
                            uptime,
                            instances,
                            shutdown_timeout,
                        } => output::print_daemon_status(pid, &uptime, instances, &shutdown_timeout),
                        other => unexpected(other)?,
                    }
                }
            },
        }

        Ok(())
    }

    fn runtime_paths(&self) -> Result<RuntimePaths> {
        match &self.home {
            Some(home) => Ok(RuntimePaths::new(absolute(home)?)),
            None => Ok(RuntimePaths::from_env()),
        }
    }
}

/// Process exit code for a failed command: 2 for configuration errors, 1 otherwise
pub fn exit_code(error: &KeeperError) -> i32 {
    match error.class() {
        ErrorClass::Config => 2,
        ErrorClass::AlreadyStopped => 0,
        _ => 1,
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn unexpected(data: ResponseData) -> Result<()> {
    Err(KeeperError::ProtocolError(format!(
        "Unexpected response from daemon: {:?}",
        data
    )))
}

fn ensure_daemon(paths: &RuntimePaths, client: &IpcClient) -> Result<()> {
    if client.is_daemon_running() {
        return Ok(());
    }
    start_daemon(paths, client)
}

/// Launch the sibling daemon binary detached and wait for its socket
fn start_daemon(paths: &RuntimePaths, client: &IpcClient) -> Result<()> {
    paths.ensure_home()?;
    let pb = output::create_progress_bar("Starting daemon...");

    let launched = std::process::Command::new(daemon_executable())
        .arg("--daemonize")
        .arg("--home")
        .arg(paths.home())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match launched {
        Ok(status) if status.success() => {}
        Ok(status) => {
            output::finish_progress_error(pb, "Daemon failed to start");
            return Err(KeeperError::Other(format!(
                "{} exited with {}; see {}",
                DAEMON_BINARY,
                status,
                paths.daemon_log().display()
            )));
        }
        Err(e) => {
            output::finish_progress_error(pb, "Daemon failed to start");
            return Err(KeeperError::Other(format!(
                "Failed to launch {}: {}",
                DAEMON_BINARY, e
            )));
        }
    }

    let deadline = Instant::now() + DAEMON_START_TIMEOUT;
    while Instant::now() < deadline {
        if client.is_daemon_running() {
            output::finish_progress_success(pb, "Daemon started");
            return Ok(());
        }
        std::thread::sleep(DAEMON_POLL_INTERVAL);
    }

    output::finish_progress_error(pb, "Daemon did not come up in time");
    Err(KeeperError::TimeoutError(format!(
        "daemon socket {} did not appear within {:?}; see {}",
        paths.socket_path().display(),
        DAEMON_START_TIMEOUT,
        paths.daemon_log().display()
    )))
}

fn stop_daemon(paths: &RuntimePaths, client: &IpcClient) -> Result<()> {
    let manager = DaemonManager::new(paths);
    if !manager.is_running() {
        output::print_info("Daemon is not running");
        return Ok(());
    }

    let reported = match client.request(Command::Daemon(DaemonCommand::Status)) {
        Ok(ResponseData::DaemonStatus {
            shutdown_timeout, ..
        }) => Some(shutdown_timeout),
        _ => None,
    };
    let timeout = stop_timeout(reported);

    let pb = output::create_progress_bar("Stopping daemon...");

    match manager.stop_daemon(timeout) {
        Ok(StopMode::Graceful) => {
            output::finish_progress_success(pb, "Daemon stopped");
            Ok(())
        }
        Ok(StopMode::Forced) => {
            output::finish_progress_success(pb, "Daemon did not drain in time and was killed");
            Ok(())
        }
        Err(e) => {
            output::finish_progress_error(pb, "Failed to stop daemon");
            Err(e)
        }
    }
}

/// How long to wait for a graceful daemon exit before SIGKILL. Uses the
/// daemon's own drain deadline when it could be asked for it.
fn stop_timeout(reported: Option<Duration>) -> Duration {
    reported.unwrap_or(SupervisorSettings::default().shutdown_timeout) + DAEMON_STOP_SLACK
}

/// `keeper-daemon` next to the running executable, else from PATH
fn daemon_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(DAEMON_BINARY))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
}
