// Daemonization support for Unix systems

use crate::error::{KeeperError, Result};

/// Detach from the controlling terminal with a double fork.
///
/// Must run before any async runtime or thread is started. stdin and stdout
/// go to /dev/null; stderr goes to `stderr_log` when given.
#[cfg(unix)]
pub fn daemonize(stderr_log: Option<&std::path::Path>) -> Result<()> {
    use nix::libc;
    use nix::unistd::{fork, setsid, ForkResult};
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(KeeperError::Other(format!("First fork failed: {}", e))),
    }

    setsid().map_err(|e| KeeperError::Other(format!("setsid failed: {}", e)))?;

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(KeeperError::Other(format!("Second fork failed: {}", e))),
    }

    std::env::set_current_dir("/")
        .map_err(|e| KeeperError::Other(format!("Failed to change directory to /: {}", e)))?;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| KeeperError::Other(format!("Failed to open /dev/null: {}", e)))?;

    let stderr_target = match stderr_log {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KeeperError::Other(format!("Failed to open {}: {}", path.display(), e)))?,
        None => devnull
            .try_clone()
            .map_err(|e| KeeperError::Other(format!("Failed to clone /dev/null: {}", e)))?,
    };

    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(devnull.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(stderr_target.as_raw_fd(), libc::STDERR_FILENO);
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_stderr_log: Option<&std::path::Path>) -> Result<()> {
    Err(KeeperError::Other(
        "Daemonization is only supported on Unix systems".to_string(),
    ))
}
