use crate::error::{KeeperError, Result};
use crate::process::types::ProcessSpec;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// How the child's stdout and stderr are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Pipes, drained into log files by the log manager
    Capture,
    /// Shared with the supervisor's own stdio
    Inherit,
}

/// Spawn the managed process described by `spec`.
///
/// The child runs in `spec.cwd` with `spec.env` layered over the inherited
/// environment, and is killed if its handle is ever dropped.
pub fn spawn_process(spec: &ProcessSpec, output: OutputMode) -> Result<SpawnedProcess> {
    let mut command = Command::new(&spec.executable);

    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match output {
        OutputMode::Capture => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputMode::Inherit => {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }

    let child = command.spawn().map_err(|source| KeeperError::Spawn {
        name: spec.name.clone(),
        source,
    })?;

    // A freshly spawned, not yet polled child always has an id
    let pid = child.id().ok_or_else(|| KeeperError::Spawn {
        name: spec.name.clone(),
        source: std::io::Error::other("process exited before its PID could be read"),
    })?;

    Ok(SpawnedProcess { child, pid })
}
