use crate::error::{KeeperError, Result};
use crate::logs::writer::{LogWriter, DEFAULT_MAX_LOG_SIZE};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// Routes managed processes' stdout and stderr into per-name log files
#[derive(Debug, Clone)]
pub struct LogManager {
    log_dir: PathBuf,
    max_file_size: u64,
}

impl LogManager {
    /// Create a log manager rooted at `log_dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&log_dir)
            .map_err(|e| KeeperError::LogError(format!("Failed to create log directory: {}", e)))?;

        Ok(Self {
            log_dir,
            max_file_size: DEFAULT_MAX_LOG_SIZE,
        })
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn stdout_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{}-out.log", name))
    }

    pub fn stderr_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{}-err.log", name))
    }

    /// Take the child's stdout/stderr pipes and drain them in background tasks.
    ///
    /// The tasks end on EOF, which happens when the child exits. A log file
    /// that cannot be opened or written does not stop the draining: lines
    /// are dropped instead, so the child never blocks on a full pipe.
    pub fn attach(&self, name: &str, child: &mut Child) -> Result<()> {
        if child.stdout.is_none() || child.stderr.is_none() {
            return Err(KeeperError::LogError(format!(
                "No output pipes available for {}",
                name
            )));
        }

        let pipes = child.stdout.take().zip(child.stderr.take());
        if let Some((stdout, stderr)) = pipes {
            let out_writer = self.open_writer(name, &self.stdout_path(name));
            let err_writer = self.open_writer(name, &self.stderr_path(name));

            tokio::spawn(pump(name.to_string(), stdout, out_writer));
            tokio::spawn(pump(name.to_string(), stderr, err_writer));
        }

        Ok(())
    }

    fn open_writer(&self, name: &str, path: &Path) -> Option<LogWriter> {
        match LogWriter::with_max_size(path, self.max_file_size) {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("Output of {} will be discarded: {}", name, e);
                None
            }
        }
    }
}

/// Minimum spacing between repeated "dropping output" warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(30);

async fn pump<R>(name: String, reader: R, mut writer: Option<LogWriter>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut dropped: u64 = 0;
    let mut last_warning: Option<Instant> = None;

    // Read to EOF no matter what happens to the log file
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(out) = writer.as_mut() else {
                    continue;
                };
                if let Err(e) = out.write_line(&line).await {
                    dropped += 1;
                    let due = last_warning.map_or(true, |at| at.elapsed() >= DROP_WARN_INTERVAL);
                    if due {
                        warn!(
                            "Dropping output for {} ({} line(s) lost so far): {}",
                            name, dropped, e
                        );
                        last_warning = Some(Instant::now());
                    }
                }
            }
            Err(e) => {
                debug!("Output pipe for {} closed: {}", name, e);
                break;
            }
        }
    }

    if let Some(mut out) = writer {
        let _ = out.flush().await;
    }
}
