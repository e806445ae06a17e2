use std::time::Duration;

use anyhow::Context;

use anssl_agent::{supervisor, version};
use anssl_updater::UpdateOptions;

/// Launch the supervisor detached; an already-running instance is restarted.
pub async fn handle_daemon(config_path: &str) -> anyhow::Result<()> {
    if supervisor::is_running() {
        println!("anssl already running, restarting...");
        supervisor::stop_daemon().await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let exec_path = std::env::current_exe().context("failed to resolve executable path")?;
    std::process::Command::new(exec_path)
        .args(["_supervisor", "-c", config_path])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to start supervisor")?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    if !supervisor::is_running() {
        anyhow::bail!("supervisor failed to start, check {}", supervisor::log_file_path(config_path).display());
    }
    println!("anssl started");

    print_update_hint(config_path).await;
    Ok(())
}

pub async fn handle_restart(config_path: &str) -> anyhow::Result<()> {
    if supervisor::is_running() {
        supervisor::stop_daemon().await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    handle_daemon(config_path).await
}

/// Best-effort: tell the operator when a newer release exists.
async fn print_update_hint(config_path: &str) {
    let Ok(cfg) = anssl_agent::config::AppConfig::load(config_path) else {
        return;
    };
    let options = UpdateOptions {
        mirror: cfg.update.mirror,
        custom_url: cfg.update.custom_url,
        proxy: cfg.update.proxy,
    };

    let check = anssl_updater::check_update(&options, version::VERSION);
    if let Ok(Ok(info)) = tokio::time::timeout(Duration::from_secs(5), check).await {
        if info.has_update {
            println!(
                "new version available: {} -> {}",
                info.current_version, info.latest_version
            );
            println!("run 'anssl update' to install it");
        }
    }
}
