// Daemon service - wires the supervisor, IPC server and state store together

use crate::config::{self, RuntimePaths, SupervisorSettings};
use crate::error::{KeeperError, Result};
use crate::ipc::protocol::{Command, DaemonCommand, ResponseData};
use crate::ipc::server::IpcServer;
use crate::logs::LogManager;
use crate::process::restart::RestartPolicy;
use crate::process::supervisor::{StatusBoard, Supervisor};
use crate::process::types::ProcessSpec;
use crate::state::{DaemonState, InstanceRecord, StateStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

/// Main daemon struct that coordinates all components
pub struct Daemon {
    paths: RuntimePaths,
    supervisor: Arc<RwLock<Supervisor>>,
    board: StatusBoard,
    state_store: StateStore,
    shutdown: Arc<watch::Sender<bool>>,
    started_at: Instant,
    shutdown_timeout: Duration,
}

impl Daemon {
    pub fn new(paths: RuntimePaths, settings: SupervisorSettings) -> Result<Self> {
        paths.ensure_home()?;
        let logs = LogManager::new(paths.log_dir())?;
        let supervisor = Supervisor::new(settings).with_log_manager(logs);
        Ok(Self::with_supervisor(paths, supervisor))
    }

    /// Build around a preconfigured supervisor (custom sampler or log manager)
    pub fn with_supervisor(paths: RuntimePaths, supervisor: Supervisor) -> Self {
        let (shutdown, _) = watch::channel(false);
        let board = supervisor.status_board();
        let shutdown_timeout = supervisor.settings().shutdown_timeout;
        Self {
            state_store: StateStore::new(paths.state_file()),
            paths,
            supervisor: Arc::new(RwLock::new(supervisor)),
            board,
            shutdown: Arc::new(shutdown),
            started_at: Instant::now(),
            shutdown_timeout,
        }
    }

    /// Start again every archived record whose last state was live
    pub async fn initialize(&self) -> Result<usize> {
        let state = self.state_store.load()?;
        let mut supervisor = self.supervisor.write().await;
        let mut restored = 0;

        for record in state.restorable() {
            match supervisor
                .start_with_tracker(record.spec.clone(), record.policy.clone(), record.tracker())
                .await
            {
                Ok(handle) => {
                    info!("Restored {} as {}", record.name, handle);
                    restored += 1;
                }
                Err(e) => error!("Failed to restore {}: {}", record.name, e),
            }
        }

        Ok(restored)
    }

    /// Run until SIGTERM, SIGINT or an IPC `Daemon(Stop)`, then drain
    pub async fn run(self) -> Result<()> {
        let restored = self.initialize().await?;
        if restored > 0 {
            info!("Restored {} process(es) from previous state", restored);
        }

        let mut server = IpcServer::new(self.paths.socket_path());
        server.start()?;
        info!("IPC server listening on {}", server.socket_path().display());

        let reconcile = tokio::spawn(Supervisor::run(
            Arc::clone(&self.supervisor),
            self.shutdown.subscribe(),
        ));
        let signals = tokio::spawn(wait_for_signal(Arc::clone(&self.shutdown)));

        let handler = self.handler();
        let served = server
            .run(
                move |command| {
                    let handler = handler.clone();
                    async move { handler.handle(command).await }
                },
                self.shutdown.subscribe(),
            )
            .await;

        // The server can also return on its own error; make sure everyone stops
        self.shutdown.send_replace(true);
        signals.abort();
        if let Err(e) = reconcile.await {
            error!("Reconciliation task failed: {}", e);
        }
        server.stop()?;

        let drained = self.shutdown().await;
        served.and(drained)
    }

    /// Archive every record, drain every instance, persist the archive
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon gracefully");
        let mut supervisor = self.supervisor.write().await;

        // Collected before draining: the drain leaves everything Stopped
        let records: Vec<InstanceRecord> = supervisor
            .instances()
            .map(InstanceRecord::from_instance)
            .collect();

        let deadline = supervisor.settings().shutdown_timeout;
        supervisor.shutdown(deadline).await;

        self.state_store.save(&DaemonState::from_records(records))?;
        info!("Daemon state saved to {}", self.state_store.path().display());
        Ok(())
    }

    pub fn handler(&self) -> CommandHandler {
        CommandHandler {
            supervisor: Arc::clone(&self.supervisor),
            board: self.board.clone(),
            state_store: self.state_store.clone(),
            shutdown: Arc::clone(&self.shutdown),
            started_at: self.started_at,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn supervisor(&self) -> Arc<RwLock<Supervisor>> {
        Arc::clone(&self.supervisor)
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Request shutdown as if `Daemon(Stop)` had arrived
    pub fn trigger_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Executes IPC commands against the shared supervisor.
///
/// Status reads go through the published board and never wait on the lock.
#[derive(Clone)]
pub struct CommandHandler {
    supervisor: Arc<RwLock<Supervisor>>,
    board: StatusBoard,
    state_store: StateStore,
    shutdown: Arc<watch::Sender<bool>>,
    started_at: Instant,
    shutdown_timeout: Duration,
}

impl CommandHandler {
    pub async fn handle(&self, command: Command) -> Result<ResponseData> {
        let response = match command {
            Command::StartFromConfig { config_path } => {
                let names = self.start_from_config(&config_path).await?;
                self.persist().await;
                ResponseData::Started { names }
            }
            Command::Stop { name, timeout_ms } => {
                let mut supervisor = self.supervisor.write().await;
                let handle = supervisor
                    .find_by_name(&name)
                    .ok_or_else(|| KeeperError::ProcessNotFound(name.clone()))?;
                let grace = match timeout_ms {
                    Some(ms) => Duration::from_millis(ms),
                    None => supervisor
                        .instance(handle)
                        .map(|instance| instance.spec().kill_timeout)
                        .unwrap_or_default(),
                };
                let snapshot = supervisor.stop(handle, grace).await?;
                drop(supervisor);
                self.persist().await;
                ResponseData::Stopped(snapshot)
            }
            Command::Restart { name } => {
                let mut supervisor = self.supervisor.write().await;
                let handle = supervisor
                    .find_by_name(&name)
                    .ok_or_else(|| KeeperError::ProcessNotFound(name.clone()))?;
                let snapshot = supervisor.restart(handle).await?;
                drop(supervisor);
                self.persist().await;
                ResponseData::Restarted(snapshot)
            }
            Command::Status { name } => {
                let board = &self.board;
                match name {
                    Some(name) => ResponseData::Status(vec![board
                        .find(&name)
                        .ok_or(KeeperError::ProcessNotFound(name))?]),
                    None => ResponseData::Status(board.all()),
                }
            }
            Command::Daemon(DaemonCommand::Status) => ResponseData::DaemonStatus {
                pid: std::process::id(),
                uptime: self.started_at.elapsed(),
                instances: self.board.all().len(),
                shutdown_timeout: self.shutdown_timeout,
            },
            Command::Daemon(DaemonCommand::Stop) => {
                info!("Shutdown requested over IPC");
                self.shutdown.send_replace(true);
                ResponseData::Success("Shutdown initiated".to_string())
            }
        };

        Ok(response)
    }

    /// Start every record of a config file. The whole file is validated
    /// before anything is started; a live instance of the same name is
    /// drained and replaced.
    async fn start_from_config(&self, config_path: &Path) -> Result<Vec<String>> {
        let records = config::load(config_path)?;
        let mut names = Vec::with_capacity(records.len());
        let mut first_error = None;

        for (spec, policy) in records {
            let name = spec.name.clone();
            match self.start_or_replace(spec, policy).await {
                Ok(()) => names.push(name),
                Err(e) => {
                    error!("Failed to start {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(names),
        }
    }

    async fn start_or_replace(&self, spec: ProcessSpec, policy: RestartPolicy) -> Result<()> {
        let mut supervisor = self.supervisor.write().await;

        match supervisor.start(spec.clone(), policy.clone()).await {
            Err(KeeperError::ProcessAlreadyExists(name)) => {
                warn!("{} is already running; replacing it", name);
                if let Some(handle) = supervisor.find_by_name(&name) {
                    match supervisor.stop(handle, spec.kill_timeout).await {
                        Ok(_) | Err(KeeperError::AlreadyStopped(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                supervisor.start(spec, policy).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    /// Best-effort snapshot so operator actions survive a daemon crash
    async fn persist(&self) {
        let records: Vec<InstanceRecord> = self
            .supervisor
            .read()
            .await
            .instances()
            .map(InstanceRecord::from_instance)
            .collect();

        if let Err(e) = self.state_store.save(&DaemonState::from_records(records)) {
            warn!("Failed to save state: {}", e);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal(shutdown: Arc<watch::Sender<bool>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    shutdown.send_replace(true);
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: Arc<watch::Sender<bool>>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C");
        shutdown.send_replace(true);
    }
}
