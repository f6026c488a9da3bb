// Daemon module - Background supervision process

pub mod daemonize;
pub mod manager;
pub mod pid;
pub mod service;

pub use daemonize::daemonize;
pub use manager::{DaemonManager, DaemonStatus, StopMode};
pub use pid::PidFile;
pub use service::{CommandHandler, Daemon};
