use crate::error::{KeeperError, Result};
use crate::logs::LogManager;
use crate::process::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::process::spawner::{spawn_process, OutputMode};
use crate::process::terminate::{parse_signal, terminate, StopOutcome};
use crate::process::types::{
    ExitKind, HealthSnapshot, InstanceHandle, InstanceState, MemorySample, ProcessSpec,
    RestartReason,
};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Child;
use tracing::{debug, error, info, warn};

/// Runtime record for one supervised process
#[derive(Debug)]
pub struct ProcessInstance {
    handle: InstanceHandle,
    spec: ProcessSpec,
    policy: RestartPolicy,
    state: InstanceState,
    /// Owned exclusively here; `None` whenever no OS process is live
    child: Option<Child>,
    pid: Option<u32>,
    tracker: RestartTracker,
    memory: Option<MemorySample>,
    started_at: Option<Instant>,
    started_wall: Option<SystemTime>,
    last_exit: Option<ExitKind>,
    last_error: Option<String>,
}

impl ProcessInstance {
    pub fn new(handle: InstanceHandle, spec: ProcessSpec, policy: RestartPolicy) -> Self {
        Self {
            handle,
            spec,
            policy,
            state: InstanceState::Starting,
            child: None,
            pid: None,
            tracker: RestartTracker::new(),
            memory: None,
            started_at: None,
            started_wall: None,
            last_exit: None,
            last_error: None,
        }
    }

    /// Carry restart counters over from an archived record
    pub fn with_tracker(mut self, tracker: RestartTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Spawn the process. Spawn failures are applied to the state machine
    /// (irrecoverable ones fail the instance, others schedule a retry) and
    /// then returned so the caller can report them.
    pub fn launch(&mut self, logs: Option<&LogManager>, now: Instant) -> Result<()> {
        debug_assert!(self.child.is_none(), "previous process must be reaped first");

        self.state = InstanceState::Starting;
        self.tracker.clear_pending();

        let output = if logs.is_some() {
            OutputMode::Capture
        } else {
            OutputMode::Inherit
        };

        match spawn_process(&self.spec, output) {
            Ok(mut spawned) => {
                if let Some(logs) = logs {
                    if let Err(e) = logs.attach(&self.spec.name, &mut spawned.child) {
                        warn!("Output of {} will not be captured: {}", self.spec.name, e);
                    }
                }

                info!(
                    "Started process {} (handle: {}, PID: {})",
                    self.spec.name, self.handle, spawned.pid
                );

                self.child = Some(spawned.child);
                self.pid = Some(spawned.pid);
                self.memory = None;
                self.started_at = Some(now);
                self.started_wall = Some(SystemTime::now());
                self.state = InstanceState::Running;
                Ok(())
            }
            Err(e) if e.is_irrecoverable_spawn() => {
                error!("Cannot spawn {}: {}", self.spec.name, e);
                self.state = InstanceState::Failed;
                self.last_error = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!("Spawn of {} failed, will retry: {}", self.spec.name, e);
                self.schedule_restart(RestartReason::SpawnFailed(e.to_string()), now);
                Err(e)
            }
        }
    }

    /// Non-blocking check for a natural exit. Reaps the child if it exited.
    pub fn poll_exit(&mut self) -> Option<ExitKind> {
        let child = self.child.as_mut()?;

        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                self.pid = None;
                Some(ExitKind::from_status(status))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to poll exit status of {}: {}", self.spec.name, e);
                None
            }
        }
    }

    /// Apply the restart policy to an exit observed by `poll_exit`
    pub fn handle_exit(&mut self, kind: ExitKind, now: Instant) {
        // Uptime before this exit still counts toward stability
        self.refresh_stability(now);

        self.last_exit = Some(kind);
        self.started_at = None;
        self.started_wall = None;
        self.memory = None;

        if kind.is_clean() {
            info!("Process {} {}", self.spec.name, kind);
        } else {
            warn!("Process {} {}", self.spec.name, kind);
        }

        if self.policy.autorestart {
            self.schedule_restart(RestartReason::Exited(kind), now);
        } else if kind.is_clean() {
            self.state = InstanceState::Stopped;
        } else {
            self.state = InstanceState::Failed;
            self.last_error = Some(format!("process {}", kind));
        }
    }

    /// Record a memory reading. Returns false when the sample is stale or
    /// belongs to a PID other than the current one.
    pub fn observe_memory(&mut self, sample: MemorySample) -> bool {
        if self.pid != Some(sample.pid) {
            return false;
        }
        if let Some(last) = &self.memory {
            if sample.taken_at < last.taken_at {
                return false;
            }
        }
        self.memory = Some(sample);
        true
    }

    /// `(resident, limit)` when the last sample exceeds the ceiling
    pub fn memory_breach(&self) -> Option<(u64, u64)> {
        let limit = self.policy.max_memory?;
        let sample = self.memory.as_ref()?;
        (sample.bytes > limit).then_some((sample.bytes, limit))
    }

    /// Reset the consecutive counter once the process has run for `min_uptime`
    pub fn refresh_stability(&mut self, now: Instant) {
        let Some(started) = self.started_at else {
            return;
        };
        if self.tracker.consecutive() > 0
            && now.saturating_duration_since(started) >= self.policy.min_uptime
        {
            debug!(
                "Process {} stable for {:?}; resetting restart counter",
                self.spec.name, self.policy.min_uptime
            );
            self.tracker.reset_consecutive();
        }
    }

    /// Schedule a restart under backoff, or fail the instance once the budget is spent
    pub fn schedule_restart(&mut self, reason: RestartReason, now: Instant) -> RestartDecision {
        let decision = self.policy.next_restart(&self.tracker);

        match decision {
            RestartDecision::Restart { delay } => {
                self.tracker.schedule(delay, now);
                self.state = InstanceState::Restarting;
                if !matches!(reason, RestartReason::Exited(ExitKind::Clean)) {
                    self.last_error = Some(reason.to_string());
                }
                info!(
                    "Restarting {} in {:?} ({}; attempt {})",
                    self.spec.name,
                    delay,
                    reason,
                    self.tracker.consecutive()
                );
            }
            RestartDecision::Exhausted { attempts } => {
                self.tracker.clear_pending();
                self.state = InstanceState::Failed;
                self.last_error = Some(format!(
                    "restart budget exhausted after {} consecutive restarts (last: {})",
                    attempts, reason
                ));
                error!(
                    "Process {} failed: restart limit of {} reached ({})",
                    self.spec.name, attempts, reason
                );
            }
        }

        decision
    }

    pub fn is_restart_due(&self, now: Instant) -> bool {
        self.state == InstanceState::Restarting && self.tracker.is_due(now)
    }

    /// Cancel a pending backoff restart
    pub fn cancel_pending(&mut self) {
        self.tracker.clear_pending();
    }

    /// Operator intervention clears the consecutive counter and the last error
    pub fn reset_for_operator(&mut self) {
        self.tracker.clear_pending();
        self.tracker.reset_consecutive();
        self.last_error = None;
    }

    /// Stop the live process, if any, and wait until it has been reaped
    pub async fn terminate(&mut self, grace: Duration) -> Result<Option<StopOutcome>> {
        let signal = parse_signal(&self.spec.stop_signal)?;
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        let previous = self.state;
        self.state = InstanceState::Stopping;
        let result = terminate(&self.spec.name, &mut child, signal, grace).await;

        match result {
            Ok(outcome) => {
                self.record_stopped(outcome);
                Ok(Some(outcome))
            }
            Err(e) => {
                // Keep ownership so a later attempt can still reap it
                self.child = Some(child);
                self.state = previous;
                Err(KeeperError::StopError(self.spec.name.clone(), e.to_string()))
            }
        }
    }

    /// Hand the child out for a parallel drain
    pub fn take_child(&mut self) -> Option<Child> {
        let child = self.child.take();
        if child.is_some() {
            self.state = InstanceState::Stopping;
        }
        child
    }

    /// Record the result of a termination performed outside this instance
    pub fn record_stopped(&mut self, outcome: StopOutcome) {
        self.last_exit = Some(outcome.exit());
        self.pid = None;
        self.memory = None;
        self.started_at = None;
        self.started_wall = None;
    }

    pub fn set_state(&mut self, state: InstanceState) {
        if self.state != state {
            debug!("{}: {} -> {}", self.spec.name, self.state, state);
        }
        if state.is_terminal() {
            self.pid = None;
            self.memory = None;
            self.started_at = None;
            self.started_wall = None;
        }
        self.state = state;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let running = self.child.is_some()
            && matches!(self.state, InstanceState::Running | InstanceState::Starting);

        HealthSnapshot {
            handle: self.handle,
            name: self.spec.name.clone(),
            state: self.state,
            pid: self.pid,
            running,
            memory_bytes: self.memory.map(|m| m.bytes),
            memory_limit: self.policy.max_memory,
            exit_code: self.last_exit.and_then(|kind| kind.code()),
            last_exit: self.last_exit,
            consecutive_restarts: self.tracker.consecutive(),
            total_restarts: self.tracker.total(),
            started_at: self.started_wall,
            last_error: self.last_error.clone(),
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn tracker(&self) -> &RestartTracker {
        &self.tracker
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::restart::BackoffSchedule;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn instance(dir: &TempDir, body: &str, policy: RestartPolicy) -> ProcessInstance {
        let exe = dir.path().join("app.sh");
        fs::write(&exe, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let spec = ProcessSpec::new("app", exe, dir.path());
        ProcessInstance::new(InstanceHandle::new(1), spec, policy)
    }

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            backoff: BackoffSchedule::new(vec![Duration::from_millis(10)]).unwrap(),
            ..RestartPolicy::new()
        }
    }

    #[tokio::test]
    async fn test_stale_and_foreign_samples_discarded() {
        let dir = TempDir::new().unwrap();
        let mut inst = instance(&dir, "sleep 30", fast_policy());
        inst.launch(None, Instant::now()).unwrap();
        let pid = inst.pid().unwrap();

        let newer = MemorySample::new(pid, 20);
        let older = MemorySample {
            bytes: 10,
            taken_at: newer.taken_at - Duration::from_millis(5),
            ..newer
        };

        assert!(inst.observe_memory(newer));
        assert!(!inst.observe_memory(older));
        assert!(!inst.observe_memory(MemorySample::new(pid + 1, 30)));
        assert_eq!(inst.snapshot().memory_bytes, Some(20));

        inst.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_breach_needs_limit() {
        let dir = TempDir::new().unwrap();
        let mut inst = instance(&dir, "sleep 30", fast_policy());
        inst.launch(None, Instant::now()).unwrap();
        let pid = inst.pid().unwrap();

        inst.observe_memory(MemorySample::new(pid, u64::MAX));
        assert_eq!(inst.memory_breach(), None);

        inst.policy.max_memory = Some(100);
        assert_eq!(inst.memory_breach(), Some((u64::MAX, 100)));

        inst.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stability_resets_counter() {
        let dir = TempDir::new().unwrap();
        let policy = RestartPolicy {
            min_uptime: Duration::from_millis(50),
            ..fast_policy()
        };
        let mut inst = instance(&dir, "sleep 30", policy);
        let start = Instant::now();

        inst.schedule_restart(RestartReason::Exited(ExitKind::Crashed(1)), start);
        assert_eq!(inst.tracker().consecutive(), 1);

        inst.launch(None, start).unwrap();
        inst.refresh_stability(start + Duration::from_millis(10));
        assert_eq!(inst.tracker().consecutive(), 1);

        inst.refresh_stability(start + Duration::from_millis(60));
        assert_eq!(inst.tracker().consecutive(), 0);
        assert_eq!(inst.tracker().total(), 1);

        inst.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn test_clean_exit_without_autorestart_stops() {
        let dir = TempDir::new().unwrap();
        let policy = RestartPolicy {
            autorestart: false,
            ..fast_policy()
        };
        let mut inst = instance(&dir, "exit 0", policy);

        inst.handle_exit(ExitKind::Clean, Instant::now());
        assert_eq!(inst.state(), InstanceState::Stopped);

        inst.handle_exit(ExitKind::Crashed(3), Instant::now());
        assert_eq!(inst.state(), InstanceState::Failed);
        assert_eq!(inst.last_error(), Some("process crashed with exit code 3"));
    }

    #[test]
    fn test_budget_exhaustion_fails() {
        let dir = TempDir::new().unwrap();
        let policy = RestartPolicy {
            max_restarts: Some(1),
            ..fast_policy()
        };
        let mut inst = instance(&dir, "exit 1", policy);
        let now = Instant::now();

        inst.handle_exit(ExitKind::Crashed(1), now);
        assert_eq!(inst.state(), InstanceState::Restarting);

        inst.handle_exit(ExitKind::Crashed(1), now);
        assert_eq!(inst.state(), InstanceState::Failed);
        assert!(inst.last_error().unwrap().contains("restart budget exhausted"));
        assert_eq!(inst.tracker().consecutive(), 1);
    }

    #[tokio::test]
    async fn test_irrecoverable_spawn_fails_instance() {
        let dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("ghost", dir.path().join("missing"), dir.path());
        let mut inst = ProcessInstance::new(InstanceHandle::new(7), spec, fast_policy());

        let err = inst.launch(None, Instant::now()).unwrap_err();
        assert!(err.is_irrecoverable_spawn());
        assert_eq!(inst.state(), InstanceState::Failed);
        assert!(!inst.snapshot().running);
    }
}
