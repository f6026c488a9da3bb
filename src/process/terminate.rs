use crate::error::{KeeperError, Result};
use crate::process::types::ExitKind;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Signals accepted as a graceful stop signal
pub const STOP_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(KeeperError::SignalError(format!(
            "Invalid signal name: {}. Must be one of: {}",
            signal_name,
            STOP_SIGNALS.join(", ")
        ))),
    }
}

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone before any signal was sent
    AlreadyExited(ExitKind),
    /// The process honored the graceful signal within the grace period
    Graceful(ExitKind),
    /// The grace period elapsed and the process was killed
    Killed(ExitKind),
}

impl StopOutcome {
    pub fn exit(&self) -> ExitKind {
        match self {
            StopOutcome::AlreadyExited(kind)
            | StopOutcome::Graceful(kind)
            | StopOutcome::Killed(kind) => *kind,
        }
    }
}

/// Send `signal`, wait up to `grace`, then SIGKILL. Returns only once the
/// child has been reaped.
pub async fn terminate(
    name: &str,
    child: &mut Child,
    signal: Signal,
    grace: Duration,
) -> Result<StopOutcome> {
    if let Some(status) = child.try_wait()? {
        return Ok(StopOutcome::AlreadyExited(ExitKind::from_status(status)));
    }

    let Some(pid) = child.id() else {
        let status = child.wait().await?;
        return Ok(StopOutcome::AlreadyExited(ExitKind::from_status(status)));
    };

    info!("Stopping process {} (PID: {}) with {}", name, pid, signal);

    match signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            let status = child.wait().await?;
            return Ok(StopOutcome::AlreadyExited(ExitKind::from_status(status)));
        }
        Err(e) => {
            warn!("Failed to send {} to {}: {}; killing instead", signal, name, e);
            child.kill().await?;
            let status = child.wait().await?;
            return Ok(StopOutcome::Killed(ExitKind::from_status(status)));
        }
    }

    debug!("Waiting {:?} for process {} to exit gracefully", grace, name);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let kind = ExitKind::from_status(status?);
            info!("Process {} {} after {}", name, kind, signal);
            Ok(StopOutcome::Graceful(kind))
        }
        Err(_) => {
            let timeout = KeeperError::TimeoutError(format!(
                "process {} did not exit within {:?}",
                name, grace
            ));
            warn!("{}; sending SIGKILL", timeout);
            child.kill().await.map_err(|e| {
                KeeperError::StopError(name.to_string(), format!("SIGKILL failed: {}", e))
            })?;
            let status = child.wait().await?;
            Ok(StopOutcome::Killed(ExitKind::from_status(status)))
        }
    }
}
