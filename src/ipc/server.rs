// IPC Server - Listens for client connections and handles requests

use crate::error::{KeeperError, Result};
use crate::ipc::protocol::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket, replacing a stale one, and restrict it to the owner
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                KeeperError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| KeeperError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                KeeperError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until `shutdown` flips to true. Each connection is
    /// served on its own task.
    pub async fn run<F, Fut>(&self, handler: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| KeeperError::IpcError("Server not started".to_string()))?;
        let handler = Arc::new(handler);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                            warn!("IPC connection error: {}", e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("IPC server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                KeeperError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Serve newline-delimited requests until the client hangs up
async fn serve_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(Command) -> Fut,
    Fut: Future<Output = Result<ResponseData>>,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| KeeperError::IpcError(format!("Failed to read request: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("IPC request {}: {:?}", request.id, request.command);
                match handler(request.command).await {
                    Ok(data) => Response::success(request.id, data),
                    Err(e) => Response::error(request.id, &e),
                }
            }
            Err(e) => Response::error(
                0,
                &KeeperError::ProtocolError(format!("Failed to deserialize request: {}", e)),
            ),
        };

        let mut json = serde_json::to_string(&response).map_err(|e| {
            KeeperError::SerializationError(format!("Failed to serialize response: {}", e))
        })?;
        json.push('\n');

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| KeeperError::IpcError(format!("Failed to write response: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| KeeperError::IpcError(format!("Failed to flush stream: {}", e)))?;
    }

    Ok(())
}
