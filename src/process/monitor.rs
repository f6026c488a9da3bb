use crate::process::types::MemorySample;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of resident-memory readings for live PIDs
pub trait MemorySampler: Send + Sync {
    /// Sample every PID that is still alive; dead PIDs are simply omitted
    fn sample(&mut self, pids: &[u32]) -> Vec<MemorySample>;
}

/// Samples resident memory from the operating system via sysinfo
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemSampler {
    fn sample(&mut self, pids: &[u32]) -> Vec<MemorySample> {
        if pids.is_empty() {
            return Vec::new();
        }

        let sys_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();

        // One refresh for the whole batch
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        pids.iter()
            .filter_map(|pid| {
                self.system
                    .process(Pid::from_u32(*pid))
                    .map(|process| MemorySample::new(*pid, process.memory()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_samples_live_process() {
        let mut sampler = SystemSampler::new();
        let mut child = Command::new("/bin/sleep").arg("5").spawn().unwrap();
        let pid = child.id().unwrap();

        let samples = sampler.sample(&[pid]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pid, pid);
        assert!(samples[0].bytes > 0);

        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_omits_dead_process() {
        let mut sampler = SystemSampler::new();
        let mut child = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let pid = child.id().unwrap();
        let _ = child.wait().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sampler.sample(&[pid]).is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let mut sampler = SystemSampler::default();
        assert!(sampler.sample(&[]).is_empty());
    }
}
