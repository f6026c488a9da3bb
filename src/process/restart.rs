use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Default consecutive restart budget
pub const DEFAULT_MAX_RESTARTS: u32 = 16;

/// Ordered backoff delays. Once the schedule is exhausted the last entry is
/// reused, so delays are non-decreasing and then flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    /// Build a schedule from explicit steps; they must be non-empty and non-decreasing
    pub fn new(steps: Vec<Duration>) -> Result<Self> {
        if steps.is_empty() {
            return Err(KeeperError::Config(
                "backoff schedule must contain at least one delay".to_string(),
            ));
        }
        if steps.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(KeeperError::Config(format!(
                "backoff schedule must be non-decreasing: {:?}",
                steps
            )));
        }
        Ok(Self { steps })
    }

    /// Doubling schedule from `initial`, capped at `max` (the cap is the final step)
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        let mut steps = Vec::new();
        let mut delay = initial.min(max);

        loop {
            steps.push(delay);
            if delay >= max || delay.is_zero() {
                break;
            }
            delay = delay.saturating_mul(2).min(max);
        }

        Self { steps }
    }

    /// Delay applied before the restart that follows `consecutive` earlier restarts
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        let idx = (consecutive as usize).min(self.steps.len() - 1);
        self.steps[idx]
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(15))
    }
}

/// When to restart a managed process and when to give up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restart after the process exits on its own
    pub autorestart: bool,
    /// Resident memory ceiling in bytes
    pub max_memory: Option<u64>,
    pub backoff: BackoffSchedule,
    /// Consecutive restart budget; `None` retries forever
    pub max_restarts: Option<u32>,
    /// Continuous uptime after which the consecutive counter resets
    pub min_uptime: Duration,
}

impl RestartPolicy {
    pub fn new() -> Self {
        Self {
            autorestart: true,
            max_memory: None,
            backoff: BackoffSchedule::default(),
            max_restarts: Some(DEFAULT_MAX_RESTARTS),
            min_uptime: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Re-check the schedule: a policy can arrive deserialized from disk
        BackoffSchedule::new(self.backoff.steps.clone())?;

        if self.max_restarts == Some(0) {
            return Err(KeeperError::Config(
                "max_restarts must be at least 1; set autorestart = false to disable restarts"
                    .to_string(),
            ));
        }
        if self.max_memory == Some(0) {
            return Err(KeeperError::Config(
                "max_memory_restart must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Decide what happens to the next restart request given the tracker's history
    pub fn next_restart(&self, tracker: &RestartTracker) -> RestartDecision {
        match self.max_restarts {
            Some(max) if tracker.consecutive() >= max => RestartDecision::Exhausted {
                attempts: tracker.consecutive(),
            },
            _ => RestartDecision::Restart {
                delay: self.backoff.delay_for(tracker.consecutive()),
            },
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    Exhausted { attempts: u32 },
}

/// Restart bookkeeping for one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    consecutive: u32,
    total: u64,
    last_delay: Option<Duration>,
    due_at: Option<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scheduled restart: bump both counters and arm the deadline
    pub fn schedule(&mut self, delay: Duration, now: Instant) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total = self.total.saturating_add(1);
        self.last_delay = Some(delay);
        self.due_at = Some(now + delay);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at.is_some_and(|due| now >= due)
    }

    pub fn due_at(&self) -> Option<Instant> {
        self.due_at
    }

    /// Disarm the pending deadline (the restart is happening or was cancelled)
    pub fn clear_pending(&mut self) {
        self.due_at = None;
    }

    /// The process proved stable, or an operator intervened
    pub fn reset_consecutive(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Rebuild a tracker from archived counters
    pub fn restore(consecutive: u32, total: u64) -> Self {
        Self {
            consecutive,
            total,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_exponential_schedule_caps_at_max() {
        let schedule = BackoffSchedule::exponential(Duration::from_secs(1), Duration::from_secs(15));
        assert_eq!(
            schedule.steps(),
            &[
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(15),
            ]
        );
    }

    #[test]
    fn test_exponential_schedule_degenerate_inputs() {
        assert_eq!(BackoffSchedule::exponential(ms(0), ms(500)).steps(), &[ms(0)]);
        assert_eq!(BackoffSchedule::exponential(ms(800), ms(500)).steps(), &[ms(500)]);
    }

    #[test]
    fn test_schedule_rejects_empty_and_decreasing() {
        assert!(matches!(BackoffSchedule::new(vec![]), Err(KeeperError::Config(_))));
        assert!(matches!(
            BackoffSchedule::new(vec![ms(100), ms(50)]),
            Err(KeeperError::Config(_))
        ));
        assert!(BackoffSchedule::new(vec![ms(100), ms(100), ms(200)]).is_ok());
    }

    #[test]
    fn test_delay_holds_last_step() {
        let schedule = BackoffSchedule::new(vec![ms(10), ms(20), ms(40)]).unwrap();
        let delays: Vec<Duration> = (0..5).map(|n| schedule.delay_for(n)).collect();
        assert_eq!(delays, vec![ms(10), ms(20), ms(40), ms(40), ms(40)]);
    }

    #[test]
    fn test_delays_monotonic_then_flat() {
        let schedule = BackoffSchedule::exponential(ms(100), ms(15_000));
        let delays: Vec<Duration> = (0..50).map(|n| schedule.delay_for(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays[schedule.len()..].iter().all(|d| *d == ms(15_000)));
    }

    #[test]
    fn test_policy_exhausts_budget() {
        let policy = RestartPolicy {
            max_restarts: Some(2),
            backoff: BackoffSchedule::new(vec![ms(1)]).unwrap(),
            ..RestartPolicy::new()
        };
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        for _ in 0..2 {
            match policy.next_restart(&tracker) {
                RestartDecision::Restart { delay } => tracker.schedule(delay, now),
                other => panic!("expected restart, got {:?}", other),
            }
        }

        assert_eq!(
            policy.next_restart(&tracker),
            RestartDecision::Exhausted { attempts: 2 }
        );
        assert_eq!(tracker.consecutive(), 2);
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = RestartPolicy {
            max_restarts: None,
            ..RestartPolicy::new()
        };
        let tracker = RestartTracker::restore(10_000, 10_000);
        assert!(matches!(
            policy.next_restart(&tracker),
            RestartDecision::Restart { .. }
        ));
    }

    #[test]
    fn test_policy_validate() {
        assert!(RestartPolicy::new().validate().is_ok());

        let zero_budget = RestartPolicy {
            max_restarts: Some(0),
            ..RestartPolicy::new()
        };
        assert!(zero_budget.validate().is_err());
    }

    #[test]
    fn test_tracker_schedule_and_reset() {
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        tracker.schedule(ms(50), now);
        assert_eq!(tracker.consecutive(), 1);
        assert_eq!(tracker.total(), 1);
        assert_eq!(tracker.last_delay(), Some(ms(50)));
        assert!(!tracker.is_due(now));
        assert!(tracker.is_due(now + ms(50)));

        tracker.clear_pending();
        assert!(!tracker.is_due(now + ms(100)));

        tracker.reset_consecutive();
        assert_eq!(tracker.consecutive(), 0);
        assert_eq!(tracker.total(), 1);
    }
}
