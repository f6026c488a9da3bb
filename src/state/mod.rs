// State module - Persistent archive of supervised instances

use crate::error::{KeeperError, Result};
use crate::process::instance::ProcessInstance;
use crate::process::restart::{RestartPolicy, RestartTracker};
use crate::process::types::{InstanceState, ProcessSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

/// Archived record of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub spec: ProcessSpec,
    pub policy: RestartPolicy,
    /// State at the time of archiving
    pub state: InstanceState,
    pub consecutive_restarts: u32,
    pub total_restarts: u64,
    pub last_error: Option<String>,
    pub archived_at: SystemTime,
}

impl InstanceRecord {
    pub fn from_instance(instance: &ProcessInstance) -> Self {
        Self {
            name: instance.name().to_string(),
            spec: instance.spec().clone(),
            policy: instance.policy().clone(),
            state: instance.state(),
            consecutive_restarts: instance.tracker().consecutive(),
            total_restarts: instance.tracker().total(),
            last_error: instance.last_error().map(str::to_string),
            archived_at: SystemTime::now(),
        }
    }

    /// Records whose last state was live are started again on daemon start
    pub fn should_restore(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn tracker(&self) -> RestartTracker {
        RestartTracker::restore(self.consecutive_restarts, self.total_restarts)
    }
}

/// Complete daemon state that gets persisted to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: String,
    pub instances: Vec<InstanceRecord>,
    pub last_updated: SystemTime,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            instances: Vec::new(),
            last_updated: SystemTime::now(),
        }
    }

    pub fn from_records(instances: Vec<InstanceRecord>) -> Self {
        Self {
            instances,
            ..Self::new()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(KeeperError::StateCorruption(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        let mut seen_names = HashSet::new();
        for record in &self.instances {
            if !seen_names.insert(&record.name) {
                return Err(KeeperError::StateCorruption(format!(
                    "Duplicate process name found: {}",
                    record.name
                )));
            }
            if record.spec.name != record.name {
                return Err(KeeperError::StateCorruption(format!(
                    "Record {} carries a spec named {}",
                    record.name, record.spec.name
                )));
            }
        }

        Ok(())
    }

    /// Records to start again, in archive order
    pub fn restorable(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.iter().filter(|record| record.should_restore())
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// State store handles persistence of daemon state to disk
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from disk; a missing file is an empty state
    pub fn load(&self) -> Result<DaemonState> {
        if !self.path.exists() {
            return Ok(DaemonState::new());
        }

        let file = File::open(&self.path).map_err(|e| {
            KeeperError::StateLoadError(format!("Failed to open state file: {}", e))
        })?;

        let state: DaemonState = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            KeeperError::StateLoadError(format!("Failed to parse state file: {}", e))
        })?;

        state.validate()?;
        Ok(state)
    }

    /// Save state to disk with an atomic temp-file-and-rename write
    pub fn save(&self, state: &DaemonState) -> Result<()> {
        state.validate()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                KeeperError::StateSaveError(format!("Failed to create state directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                KeeperError::StateSaveError(format!("Failed to create temp state file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer_pretty(&mut writer, state).map_err(|e| {
                KeeperError::StateSaveError(format!("Failed to serialize state: {}", e))
            })?;

            writer.flush().map_err(|e| {
                KeeperError::StateSaveError(format!("Failed to flush state file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            KeeperError::StateSaveError(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                KeeperError::StateError(format!("Failed to clear state file: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, state: InstanceState) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            spec: ProcessSpec::new(name, "/bin/sleep", "/tmp"),
            policy: RestartPolicy::new(),
            state,
            consecutive_restarts: 2,
            total_restarts: 9,
            last_error: None,
            archived_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let state = store.load().unwrap();
        assert!(state.instances.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        let state = DaemonState::from_records(vec![
            record("api", InstanceState::Running),
            record("worker", InstanceState::Failed),
        ]);

        store.save(&state).unwrap();
        assert!(!dir.path().join("nested/state.tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_restorable_skips_terminal_records() {
        let state = DaemonState::from_records(vec![
            record("running", InstanceState::Running),
            record("backing-off", InstanceState::Restarting),
            record("stopped", InstanceState::Stopped),
            record("failed", InstanceState::Failed),
        ]);

        let names: Vec<&str> = state.restorable().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["running", "backing-off"]);
        assert_eq!(state.instances[0].tracker().total(), 9);
    }

    #[test]
    fn test_duplicate_names_are_corruption() {
        let state = DaemonState::from_records(vec![
            record("api", InstanceState::Running),
            record("api", InstanceState::Stopped),
        ]);
        assert!(matches!(
            state.validate(),
            Err(KeeperError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_version_mismatch_is_corruption() {
        let mut state = DaemonState::new();
        state.version = "0.1.0".to_string();
        assert!(matches!(
            state.validate(),
            Err(KeeperError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_corrupted_file_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let store = StateStore::new(&path);
        assert!(matches!(store.load(), Err(KeeperError::StateLoadError(_))));

        store.clear().unwrap();
        assert!(!path.exists());
    }
}
