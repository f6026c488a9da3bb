use crate::config::SupervisorSettings;
use crate::error::{KeeperError, Result};
use crate::logs::LogManager;
use crate::process::instance::ProcessInstance;
use crate::process::monitor::{MemorySampler, SystemSampler};
use crate::process::restart::{RestartPolicy, RestartTracker};
use crate::process::terminate::{parse_signal, terminate};
use crate::process::types::{
    HealthSnapshot, InstanceHandle, InstanceState, ProcessSpec, RestartReason,
};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};


type Board = BTreeMap<InstanceHandle, HealthSnapshot>;

/// Lock-free read side of the supervisor's published snapshots
#[derive(Debug, Clone)]
pub struct StatusBoard {
    rx: watch::Receiver<Board>,
}

impl StatusBoard {
    pub fn get(&self, handle: InstanceHandle) -> Option<HealthSnapshot> {
        self.rx.borrow().get(&handle).cloned()
    }

    pub fn find(&self, name: &str) -> Option<HealthSnapshot> {
        self.rx
            .borrow()
            .values()
            .find(|snapshot| snapshot.name == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<HealthSnapshot> {
        self.rx.borrow().values().cloned().collect()
    }

    /// Wait until the next publish
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Owns every supervised instance and applies the restart policy
pub struct Supervisor {
    settings: SupervisorSettings,
    instances: BTreeMap<InstanceHandle, ProcessInstance>,
    next_handle: u64,
    sampler: Box<dyn MemorySampler>,
    logs: Option<LogManager>,
    board: watch::Sender<Board>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (board, _) = watch::channel(Board::new());
        Self {
            settings,
            instances: BTreeMap::new(),
            next_handle: 1,
            sampler: Box::new(SystemSampler::new()),
            logs: None,
            board,
        }
    }

    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Capture child output into log files instead of inheriting stdio
    pub fn with_log_manager(mut self, logs: LogManager) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Validate and launch a new instance.
    ///
    /// Config errors register nothing. An irrecoverable spawn error registers
    /// the instance as `Failed` and is returned; a retryable one leaves the
    /// instance `Restarting` and still yields its handle.
    pub async fn start(&mut self, spec: ProcessSpec, policy: RestartPolicy) -> Result<InstanceHandle> {
        self.start_with_tracker(spec, policy, RestartTracker::new())
            .await
    }

    /// Like `start`, continuing restart counters from an archived record
    pub async fn start_with_tracker(
        &mut self,
        spec: ProcessSpec,
        policy: RestartPolicy,
        tracker: RestartTracker,
    ) -> Result<InstanceHandle> {
        spec.validate()?;
        policy.validate()?;

        if spec.instances > 1 {
            warn!(
                "{}: instances = {} requested; supervising a single instance",
                spec.name, spec.instances
            );
        }
        if spec.watch {
            warn!("{}: watch = true is accepted but file watching is not performed", spec.name);
        }

        if let Some(existing) = self.find_by_name(&spec.name) {
            let state = self.instances[&existing].state();
            if !state.is_terminal() {
                return Err(KeeperError::ProcessAlreadyExists(spec.name));
            }
            debug!("Replacing {} record of {}", state, spec.name);
            self.instances.remove(&existing);
        }

        let handle = InstanceHandle::new(self.next_handle);
        self.next_handle += 1;

        let mut instance = ProcessInstance::new(handle, spec, policy).with_tracker(tracker);
        let launched = instance.launch(self.logs.as_ref(), Instant::now());
        self.instances.insert(handle, instance);
        self.publish();

        match launched {
            Ok(()) => Ok(handle),
            Err(e) if e.is_irrecoverable_spawn() => Err(e),
            Err(_) => Ok(handle),
        }
    }

    /// Gracefully stop an instance and cancel any pending restart
    pub async fn stop(&mut self, handle: InstanceHandle, grace: Duration) -> Result<HealthSnapshot> {
        let instance = self.instance_mut(handle)?;

        if instance.state().is_terminal() {
            return Err(KeeperError::AlreadyStopped(instance.name().to_string()));
        }

        instance.cancel_pending();
        let result = instance.terminate(grace).await;
        if result.is_ok() {
            instance.set_state(InstanceState::Stopped);
            info!("Stopped {}", instance.name());
        }
        let snapshot = instance.snapshot();
        self.publish();

        result.map(|_| snapshot)
    }

    /// Operator restart: terminate if live, clear the counter, spawn afresh
    pub async fn restart(&mut self, handle: InstanceHandle) -> Result<HealthSnapshot> {
        let logs = self.logs.clone();
        let instance = self.instance_mut(handle)?;
        let grace = instance.spec().kill_timeout;

        let stopped = instance.terminate(grace).await;
        if let Err(e) = stopped {
            self.publish();
            return Err(e);
        }

        instance.reset_for_operator();
        info!("Operator restart of {}", instance.name());
        let launched = instance.launch(logs.as_ref(), Instant::now());
        let snapshot = instance.snapshot();
        self.publish();

        match launched {
            Err(e) if e.is_irrecoverable_spawn() => Err(e),
            _ => Ok(snapshot),
        }
    }

    /// Last published snapshot; never touches the child process
    pub fn poll_health(&self, handle: InstanceHandle) -> Result<HealthSnapshot> {
        self.board
            .borrow()
            .get(&handle)
            .cloned()
            .ok_or_else(|| KeeperError::ProcessNotFound(handle.to_string()))
    }

    pub fn status_board(&self) -> StatusBoard {
        StatusBoard {
            rx: self.board.subscribe(),
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<InstanceHandle> {
        self.instances
            .values()
            .find(|instance| instance.name() == name)
            .map(|instance| instance.handle())
    }

    pub fn instance(&self, handle: InstanceHandle) -> Option<&ProcessInstance> {
        self.instances.get(&handle)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.instances.values()
    }

    fn instance_mut(&mut self, handle: InstanceHandle) -> Result<&mut ProcessInstance> {
        self.instances
            .get_mut(&handle)
            .ok_or_else(|| KeeperError::ProcessNotFound(handle.to_string()))
    }

    /// One reconciliation pass over every instance
    pub async fn reconcile(&mut self) {
        let now = Instant::now();

        let pids: Vec<u32> = self
            .instances
            .values()
            .filter(|instance| instance.state() == InstanceState::Running)
            .filter_map(|instance| instance.pid())
            .collect();
        let samples = self.sampler.sample(&pids);

        let logs = self.logs.as_ref();
        for instance in self.instances.values_mut() {
            match instance.state() {
                InstanceState::Starting | InstanceState::Running => {
                    // A natural exit wins over a breach seen in the same pass
                    if let Some(kind) = instance.poll_exit() {
                        instance.handle_exit(kind, now);
                        continue;
                    }

                    if let Some(sample) = samples.iter().find(|s| Some(s.pid) == instance.pid()) {
                        instance.observe_memory(*sample);
                    }

                    if let Some((bytes, limit)) = instance.memory_breach() {
                        warn!(
                            "Process {} exceeded memory limit: {} > {} bytes",
                            instance.name(),
                            bytes,
                            limit
                        );
                        let grace = instance.spec().kill_timeout;
                        if let Err(e) = instance.terminate(grace).await {
                            error!("Failed to stop {} after memory breach: {}", instance.name(), e);
                            continue;
                        }
                        instance.schedule_restart(
                            RestartReason::MemoryBreach { bytes, limit },
                            Instant::now(),
                        );
                    } else {
                        instance.refresh_stability(now);
                    }
                }
                InstanceState::Restarting if instance.is_restart_due(now) => {
                    if let Err(e) = instance.launch(logs, now) {
                        debug!("Relaunch of {} did not succeed: {}", instance.name(), e);
                    }
                }
                _ => {}
            }
        }

        self.publish();
    }

    /// Drive `reconcile` at the poll interval until `shutdown` flips to true
    pub async fn run(supervisor: Arc<RwLock<Supervisor>>, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = supervisor.read().await.settings.poll_interval;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Reconciliation loop started (interval: {:?})", poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    supervisor.write().await.reconcile().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    /// Stop every instance in parallel. Children still alive at `deadline`
    /// are killed when their drain task is aborted.
    pub async fn shutdown(&mut self, deadline: Duration) {
        let mut drains = JoinSet::new();

        for instance in self.instances.values_mut() {
            instance.cancel_pending();
            let signal = parse_signal(&instance.spec().stop_signal).unwrap_or(Signal::SIGTERM);
            let grace = instance.spec().kill_timeout.min(deadline);
            let handle = instance.handle();
            let name = instance.name().to_string();

            match instance.take_child() {
                Some(mut child) => {
                    drains.spawn(async move {
                        let outcome = terminate(&name, &mut child, signal, grace).await;
                        (handle, outcome)
                    });
                }
                None => {
                    if !instance.state().is_terminal() {
                        instance.set_state(InstanceState::Stopped);
                    }
                }
            }
        }

        info!("Draining {} process(es)", drains.len());
        self.publish();

        let drained = tokio::time::timeout(deadline, async {
            let mut results = Vec::new();
            while let Some(joined) = drains.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => error!("Drain task failed: {}", e),
                }
            }
            results
        })
        .await;

        let results = match drained {
            Ok(results) => results,
            Err(_) => {
                warn!("Shutdown deadline of {:?} reached; killing remaining processes", deadline);
                drains.abort_all();
                while drains.join_next().await.is_some() {}
                Vec::new()
            }
        };

        for (handle, outcome) in results {
            if let Some(instance) = self.instances.get_mut(&handle) {
                match outcome {
                    Ok(outcome) => instance.record_stopped(outcome),
                    Err(e) => warn!("Failed to stop {}: {}", instance.name(), e),
                }
            }
        }

        for instance in self.instances.values_mut() {
            if instance.state() == InstanceState::Stopping {
                instance.set_state(InstanceState::Stopped);
            }
        }

        self.publish();
    }

    fn publish(&self) {
        let board: Board = self
            .instances
            .iter()
            .map(|(handle, instance)| (*handle, instance.snapshot()))
            .collect();
        self.board.send_replace(board);
    }
}
