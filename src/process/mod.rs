// Process module - Supervision of managed processes

pub mod instance;
pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod terminate;
pub mod types;

pub use instance::ProcessInstance;
pub use monitor::{MemorySampler, SystemSampler};
pub use restart::{BackoffSchedule, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_process, OutputMode, SpawnedProcess};
pub use supervisor::{StatusBoard, Supervisor};
pub use terminate::StopOutcome;
pub use types::{
    ExitKind, HealthSnapshot, InstanceHandle, InstanceState, MemorySample, ProcessSpec,
    RestartReason,
};
