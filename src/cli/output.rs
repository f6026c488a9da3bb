// Output formatting and display for CLI

use crate::config::format_bytes;
use crate::process::types::{HealthSnapshot, InstanceState};
use chrono::{DateTime, Local};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

pub fn print_started(names: &[String]) {
    println!(
        "{}",
        format!("✓ Started {} process(es)", names.len()).green().bold()
    );
    for name in names {
        println!("  {} {}", "•".dimmed(), name.cyan());
    }
}

pub fn print_stopped(snapshot: &HealthSnapshot) {
    println!(
        "{}",
        format!("✓ Process {} stopped", snapshot.name).green().bold()
    );
    if let Some(exit) = snapshot.last_exit {
        println!("  {}: {}", "Exit".bold(), exit);
    }
}

pub fn print_restarted(snapshot: &HealthSnapshot) {
    println!(
        "{}",
        format!("✓ Process {} restarted", snapshot.name).green().bold()
    );
    println!("  {}: {}", "State".bold(), format_state_colored(snapshot.state));
    if let Some(pid) = snapshot.pid {
        println!("  {}: {}", "PID".bold(), pid);
    }
}

pub fn print_daemon_status(pid: u32, uptime: &Duration, instances: usize, shutdown_timeout: &Duration) {
    println!("{}", "✓ Daemon is running".green().bold());
    println!("  {}: {}", "PID".bold(), pid);
    println!("  {}: {}", "Uptime".bold(), format_duration(uptime));
    println!("  {}: {}", "Processes".bold(), instances);
    println!("  {}: {}", "Shutdown timeout".bold(), format_duration(shutdown_timeout));
}

pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of instances
pub fn print_status_table(snapshots: &[HealthSnapshot]) {
    if snapshots.is_empty() {
        println!("{}", "No processes are managed".yellow());
        return;
    }

    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last error")]
        last_error: String,
    }

    let rows: Vec<StatusRow> = snapshots
        .iter()
        .map(|s| StatusRow {
            name: truncate(&s.name, 20),
            state: format_state_colored(s.state),
            pid: dash_or(s.pid),
            memory: format_memory(s),
            uptime: s
                .uptime()
                .map(|uptime| format_duration(&uptime))
                .unwrap_or_else(|| "-".to_string()),
            restarts: format!("{} / {}", s.consecutive_restarts, s.total_restarts),
            last_error: s
                .last_error
                .as_deref()
                .map(|e| truncate(e, 40))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", snapshots.len())
            .dimmed()
            .italic()
    );
}

/// Print detailed status view for a single instance
pub fn print_detailed_status(snapshot: &HealthSnapshot) {
    println!("\n{}", "Process Details".bold().underline());
    println!();
    println!("  {:<22} {}", "Name:".bold(), snapshot.name.cyan());
    println!("  {:<22} {}", "Handle:".bold(), snapshot.handle);
    println!(
        "  {:<22} {}",
        "State:".bold(),
        format_state_colored(snapshot.state)
    );
    println!("  {:<22} {}", "PID:".bold(), dash_or(snapshot.pid));
    println!("  {:<22} {}", "Memory:".bold(), format_memory(snapshot));

    if let Some(uptime) = snapshot.uptime() {
        println!("  {:<22} {}", "Uptime:".bold(), format_duration(&uptime));
    }
    if let Some(started) = snapshot.started_at {
        let datetime: DateTime<Local> = started.into();
        println!(
            "  {:<22} {}",
            "Started:".bold(),
            datetime.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!(
        "  {:<22} {}",
        "Consecutive restarts:".bold(),
        snapshot.consecutive_restarts
    );
    println!(
        "  {:<22} {}",
        "Total restarts:".bold(),
        snapshot.total_restarts
    );

    if let Some(exit) = snapshot.last_exit {
        println!("  {:<22} {}", "Last exit:".bold(), exit);
    }
    if let Some(error) = &snapshot.last_error {
        println!("  {:<22} {}", "Last error:".bold(), error.red());
    }

    println!();
}

fn format_state_colored(state: InstanceState) -> String {
    match state {
        InstanceState::Running => state.to_string().green().to_string(),
        InstanceState::Starting | InstanceState::Restarting | InstanceState::Stopping => {
            state.to_string().yellow().to_string()
        }
        InstanceState::Stopped => state.to_string().bright_black().to_string(),
        InstanceState::Failed => state.to_string().red().bold().to_string(),
    }
}

/// Current usage against the limit, when one is configured
fn format_memory(snapshot: &HealthSnapshot) -> String {
    match (snapshot.memory_bytes, snapshot.memory_limit) {
        (Some(used), Some(limit)) => format!("{} / {}", format_bytes(used), format_bytes(limit)),
        (Some(used), None) => format_bytes(used),
        (None, _) => "-".to_string(),
    }
}

fn dash_or<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner shown while waiting on the daemon
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn finish_progress_success(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✓".green(), message));
}

pub fn finish_progress_error(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✗".red(), message));
}
