use anyhow::{Context, Result};
use clap::Parser;
use keeper::config::{RuntimePaths, SupervisorSettings};
use keeper::daemon::{daemonize, Daemon, DaemonManager};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// keeper supervision daemon
#[derive(Parser, Debug)]
#[command(name = "keeper-daemon", version, about, long_about = None)]
struct Args {
    /// Detach from the terminal and run in the background
    #[arg(long)]
    daemonize: bool,

    /// Runtime directory (socket, PID file, state, logs); defaults to $KEEPER_HOME
    #[arg(long)]
    home: Option<PathBuf>,

    /// Reconciliation interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Total time allowed to drain every process on shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = match args.home {
        // Made absolute now; daemonizing moves the working directory to /
        Some(home) if home.is_relative() => RuntimePaths::new(
            std::env::current_dir()
                .context("Failed to resolve the current directory")?
                .join(home),
        ),
        Some(home) => RuntimePaths::new(home),
        None => RuntimePaths::from_env(),
    };
    paths
        .ensure_home()
        .with_context(|| format!("Failed to create {}", paths.home().display()))?;

    let settings = SupervisorSettings {
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
    };

    // Forking must happen before the runtime starts any threads
    if args.daemonize {
        daemonize(Some(&paths.daemon_log())).context("Failed to daemonize")?;
    }

    init_tracing(&paths)?;

    let manager = DaemonManager::new(&paths);
    manager
        .register_daemon()
        .context("Failed to register daemon")?;
    tracing::info!(
        "keeper daemon started (PID {}, home {})",
        std::process::id(),
        paths.home().display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the async runtime")?;

    let result = runtime.block_on(async {
        let daemon = Daemon::new(paths.clone(), settings)?;
        daemon.run().await
    });

    if let Err(e) = manager.unregister_daemon() {
        tracing::warn!("Failed to remove PID file: {}", e);
    }
    tracing::info!("keeper daemon stopped");

    result.context("Daemon exited with an error")
}

fn init_tracing(paths: &RuntimePaths) -> Result<()> {
    let log_path = paths.daemon_log();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();

    Ok(())
}
