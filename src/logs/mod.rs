// Logs module - Capture of managed process output

mod manager;
mod writer;

pub use manager::LogManager;
pub use writer::{LogWriter, DEFAULT_MAX_LOG_SIZE};
