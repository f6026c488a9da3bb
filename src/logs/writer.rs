use crate::error::{KeeperError, Result};
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Default maximum log file size before rotation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Appends timestamped lines to one log file, rotating it by size
pub struct LogWriter {
    path: PathBuf,
    file: TokioFile,
    max_size: u64,
    size: u64,
}

impl LogWriter {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_max_size(path, DEFAULT_MAX_LOG_SIZE)
    }

    pub fn with_max_size(path: &Path, max_size: u64) -> Result<Self> {
        let file = open_append(path)?;

        // Appending to an existing file continues its size budget
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            file: TokioFile::from_std(file),
            max_size,
            size,
        })
    }

    /// Write one line as `[YYYY-MM-DD HH:MM:SS.mmm] <line>`
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if self.size >= self.max_size {
            self.rotate().await?;
        }

        let entry = format_log_entry(&Local::now(), line);

        self.file
            .write_all(&entry)
            .await
            .map_err(|e| KeeperError::LogError(format!("Failed to write to log: {}", e)))?;

        self.file
            .flush()
            .await
            .map_err(|e| KeeperError::LogError(format!("Failed to flush log: {}", e)))?;

        self.size += entry.len() as u64;
        Ok(())
    }

    /// Rename the current file aside with a timestamp and start a fresh one
    async fn rotate(&mut self) -> Result<()> {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S-%3f").to_string();
        let parent = self.path.parent().ok_or_else(|| {
            KeeperError::LogRotationError("Invalid log file path".to_string())
        })?;
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| KeeperError::LogRotationError("Invalid log file name".to_string()))?;

        let rotated = parent.join(format!("{}-{}.log", stem, timestamp));

        self.file.flush().await.map_err(|e| {
            KeeperError::LogRotationError(format!("Failed to flush before rotation: {}", e))
        })?;
        tokio::fs::rename(&self.path, &rotated)
            .await
            .map_err(|e| KeeperError::LogRotationError(format!("Failed to rotate log: {}", e)))?;

        self.file = TokioFile::from_std(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| KeeperError::LogError(format!("Failed to flush log: {}", e)))
    }
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            KeeperError::LogError(format!("Failed to open log file {}: {}", path.display(), e))
        })
}

fn format_log_entry(timestamp: &DateTime<Local>, line: &[u8]) -> Vec<u8> {
    let timestamp = timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut entry = Vec::with_capacity(timestamp.len() + 4 + line.len());
    entry.push(b'[');
    entry.extend_from_slice(timestamp.as_bytes());
    entry.extend_from_slice(b"] ");
    entry.extend_from_slice(line);
    entry.push(b'\n');
    entry
}
