// IPC Client - Communicates with the daemon via Unix socket

use crate::error::{KeeperError, Result};
use crate::ipc::protocol::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection retry attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Generous bound on one exchange; drains can take a full grace timeout
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// IPC client for communicating with the daemon
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and return the daemon's data, or its error as `KeeperError::Remote`
    pub fn request(&self, command: Command) -> Result<ResponseData> {
        self.send_command(command)?.into_result()
    }

    /// Send a command to the daemon and wait for the raw response.
    ///
    /// Only connection failures are retried; once a request has been written
    /// it is never sent twice.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let mut stream = self.connect_with_retry()?;
        let response = Self::exchange(&mut stream, &request)?;

        if response.id != request_id {
            return Err(KeeperError::ProtocolError(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }

        Ok(response)
    }

    /// True when a daemon answers on the socket
    pub fn is_daemon_running(&self) -> bool {
        self.connect().is_ok()
    }

    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                // No socket at all: retrying will not help
                Err(KeeperError::DaemonNotRunning) if !self.socket_path.exists() => {
                    return Err(KeeperError::DaemonNotRunning)
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            KeeperError::ConnectionError("Failed to connect after retries".to_string())
        }))
    }

    fn exchange(stream: &mut UnixStream, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request).map_err(|e| {
            KeeperError::SerializationError(format!("Failed to serialize request: {}", e))
        })?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| KeeperError::IpcError(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| KeeperError::IpcError(format!("Failed to flush stream: {}", e)))?;

        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| KeeperError::IpcError(format!("Failed to set read timeout: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader
            .read_line(&mut response_line)
            .map_err(|e| KeeperError::IpcError(format!("Failed to read response: {}", e)))?;
        if read == 0 {
            return Err(KeeperError::IpcError(
                "Daemon closed the connection without responding".to_string(),
            ));
        }

        serde_json::from_str(&response_line).map_err(|e| {
            KeeperError::DeserializationError(format!("Failed to deserialize response: {}", e))
        })
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(KeeperError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                KeeperError::DaemonNotRunning
            } else {
                KeeperError::ConnectionError(format!("Failed to connect to daemon: {}", e))
            }
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::DaemonCommand;

    #[test]
    fn test_client_with_custom_path() {
        let client = IpcClient::new("/tmp/custom.sock");
        assert_eq!(client.socket_path(), Path::new("/tmp/custom.sock"));
    }

    #[test]
    fn test_request_id_increment() {
        let client = IpcClient::new("/tmp/custom.sock");
        let id1 = client.request_id.load(Ordering::SeqCst);
        client.request_id.fetch_add(1, Ordering::SeqCst);
        assert_eq!(client.request_id.load(Ordering::SeqCst), id1 + 1);
    }

    #[test]
    fn test_daemon_not_running_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = IpcClient::new(dir.path().join("nonexistent.sock"));

        let result = client.send_command(Command::Daemon(DaemonCommand::Status));
        assert!(matches!(result, Err(KeeperError::DaemonNotRunning)));
        assert!(!client.is_daemon_running());
    }
}
