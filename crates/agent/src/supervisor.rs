//! Parent process keeping the worker alive.
//!
//! The supervisor re-invokes its own binary with `start -c {config}`,
//! restarts it after crashes with a growing delay, respawns immediately
//! after a clean exit that left the update marker, and tears the child down
//! on SIGTERM/SIGINT or the stop marker.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const PID_FILE: &str = ".anssl.pid";
pub const STOP_MARKER: &str = ".anssl-stop";
pub const LOG_FILE: &str = "anssl.log";

const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);
const FAST_EXIT_WINDOW: Duration = Duration::from_secs(10);
const CHILD_GRACE: Duration = Duration::from_secs(5);

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn pid_file_path() -> PathBuf {
    home_dir().join(PID_FILE)
}

pub fn stop_marker_path() -> PathBuf {
    home_dir().join(STOP_MARKER)
}

/// The log file lives next to the config file so one host keeps one log.
pub fn log_file_path(config_path: &str) -> PathBuf {
    let config = Path::new(config_path);
    let dir = config.parent().filter(|p| !p.as_os_str().is_empty());
    dir.unwrap_or_else(|| Path::new(".")).join(LOG_FILE)
}

/// Crash-looping children back off linearly, one second per consecutive
/// failure, capped at 30 s.
pub fn restart_delay(consecutive_failures: u32) -> Duration {
    Duration::from_secs(u64::from(consecutive_failures)).min(MAX_RESTART_DELAY)
}

pub fn read_pid() -> Option<i32> {
    read_pid_at(&pid_file_path())
}

fn read_pid_at(path: &Path) -> Option<i32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

fn write_pid_at(path: &Path, pid: u32) -> anyhow::Result<()> {
    fs::write(path, pid.to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

/// Whether the pid from the pid file is alive.
pub fn is_running() -> bool {
    match read_pid() {
        Some(pid) => process_alive(pid),
        None => false,
    }
}

pub fn process_alive(pid: i32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn signal_terminate(pid: i32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn signal_kill(pid: i32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn stop_marker_present(path: &Path) -> bool {
    if path.exists() {
        let _ = fs::remove_file(path);
        true
    } else {
        false
    }
}

/// Supervisor main loop; returns when the worker exits for good or a stop
/// is requested.
pub async fn run(config_path: &str) -> anyhow::Result<()> {
    let exec_path = std::env::current_exe().context("failed to resolve executable path")?;
    let pid_file = pid_file_path();
    let stop_marker = stop_marker_path();
    let log_file = log_file_path(config_path);

    write_pid_at(&pid_file, std::process::id())?;
    info!(pid = std::process::id(), "supervisor started");

    let mut consecutive_failures: u32 = 0;

    loop {
        if stop_marker_present(&stop_marker) {
            info!("stop marker found, supervisor exiting");
            let _ = fs::remove_file(&pid_file);
            return Ok(());
        }

        let mut child = match spawn_worker(&exec_path, config_path, &log_file) {
            Ok(child) => child,
            Err(err) => {
                error!(?err, "failed to spawn worker");
                consecutive_failures = consecutive_failures.saturating_add(1);
                tokio::time::sleep(restart_delay(consecutive_failures)).await;
                continue;
            }
        };

        let started_at = Instant::now();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = shutdown_signal() => {
                info!("stop signal received, terminating worker");
                terminate_child(&mut child).await;
                let _ = fs::remove_file(&pid_file);
                let _ = fs::remove_file(&stop_marker);
                return Ok(());
            }
        };

        let uptime = started_at.elapsed();

        match status {
            Ok(status) if status.success() => {
                if anssl_updater::consume_update_marker() {
                    info!("update marker found, respawning into new binary");
                    consecutive_failures = 0;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                info!("worker exited cleanly, supervisor done");
                let _ = fs::remove_file(&pid_file);
                return Ok(());
            }
            Ok(status) => {
                warn!(?status, ?uptime, "worker exited abnormally");
                if uptime < FAST_EXIT_WINDOW {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = restart_delay(consecutive_failures);
                    info!(?delay, "waiting before respawn");
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                }
            }
            Err(err) => {
                error!(?err, "failed to wait on worker");
                consecutive_failures = consecutive_failures.saturating_add(1);
                tokio::time::sleep(restart_delay(consecutive_failures)).await;
            }
        }
    }
}

fn spawn_worker(exec_path: &Path, config_path: &str, log_file: &Path) -> anyhow::Result<Child> {
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;
    let log_err = log.try_clone().context("failed to clone log handle")?;

    Command::new(exec_path)
        .args(["start", "-c", config_path])
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_err))
        .spawn()
        .context("failed to spawn worker process")
}

/// SIGTERM the child, give it 5 s, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_terminate(pid as i32);
    }

    match tokio::time::timeout(CHILD_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("worker did not exit within grace period, killing");
            let _ = child.kill().await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Stop a running supervisor from the CLI: stop marker as the fallback,
/// SIGTERM as the primary path, SIGKILL after a 10 s wait.
pub async fn stop_daemon() -> anyhow::Result<()> {
    let stop_marker = stop_marker_path();
    let pid_file = pid_file_path();
    let _ = fs::write(&stop_marker, "stop");

    let Some(pid) = read_pid() else {
        anyhow::bail!("pid file missing or unreadable: {}", pid_file.display());
    };

    if !process_alive(pid) {
        let _ = fs::remove_file(&pid_file);
        let _ = fs::remove_file(&stop_marker);
        return Ok(());
    }

    signal_terminate(pid);

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !process_alive(pid) {
            let _ = fs::remove_file(&pid_file);
            let _ = fs::remove_file(&stop_marker);
            return Ok(());
        }
    }

    warn!(pid, "supervisor did not exit in time, killing");
    signal_kill(pid);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let _ = fs::remove_file(&pid_file);
    let _ = fs::remove_file(&stop_marker);
    Ok(())
}
