use anssl_agent::{config::AppConfig, version};
use anssl_updater::UpdateOptions;

fn update_options(config_path: &str) -> UpdateOptions {
    // The update commands stay usable with a broken or missing config;
    // they just lose mirror/proxy settings.
    match AppConfig::load(config_path) {
        Ok(cfg) => UpdateOptions {
            mirror: cfg.update.mirror,
            custom_url: cfg.update.custom_url,
            proxy: cfg.update.proxy,
        },
        Err(_) => UpdateOptions::default(),
    }
}

pub async fn handle_check_update(config_path: &str) -> anyhow::Result<()> {
    let options = update_options(config_path);
    let info = anssl_updater::check_update(&options, version::VERSION).await?;

    if !info.has_update {
        println!("already up to date ({})", info.current_version);
        return Ok(());
    }

    println!(
        "new version available: {} -> {}",
        info.current_version, info.latest_version
    );
    if !info.release_notes.is_empty() {
        println!("\n{}", info.release_notes);
    }
    println!("\nrun 'anssl update' to install it");
    Ok(())
}

pub async fn handle_update(config_path: &str) -> anyhow::Result<()> {
    let options = update_options(config_path);
    let info = anssl_updater::check_update(&options, version::VERSION).await?;

    if !info.has_update {
        println!("already up to date ({})", info.current_version);
        return Ok(());
    }

    println!(
        "updating {} -> {} ...",
        info.current_version, info.latest_version
    );
    anssl_updater::perform_update(&options, &info).await?;
    println!("updated to {}", info.latest_version);
    println!("restart the agent with 'anssl restart' to pick it up");
    Ok(())
}
