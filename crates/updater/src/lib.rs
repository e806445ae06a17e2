//! Self-update for the anssl agent.
//!
//! Resolves the latest release, downloads and verifies the platform
//! archive, swaps the running executable in place, and leaves the update
//! marker the supervisor looks for after a clean worker exit.

mod archive;
mod release;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

pub use archive::{checksum_for, extract_binary, sha256_hex, verify_sha256};
pub use release::{
    asset_name_for, fetch_latest_release, is_newer_version, platform_asset_name,
    transform_download_url, GitHubRelease,
};

pub const UPDATE_MARKER: &str = ".anssl-updated";

const GITHUB_API_BASE: &str = "https://api.github.com";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Update-related settings from the agent config.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub mirror: String,
    pub custom_url: String,
    pub proxy: String,
}

#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: String,
    pub has_update: bool,
    pub download_url: String,
    pub checksum_url: String,
    pub release_notes: String,
    pub asset_name: String,
}

pub async fn check_update(
    options: &UpdateOptions,
    current_version: &str,
) -> anyhow::Result<UpdateInfo> {
    check_update_at(options, current_version, GITHUB_API_BASE).await
}

async fn check_update_at(
    options: &UpdateOptions,
    current_version: &str,
    api_base: &str,
) -> anyhow::Result<UpdateInfo> {
    let client = build_client(options)?;
    let release = fetch_latest_release(&client, api_base)
        .await
        .context("failed to resolve latest release")?;

    let latest_version = release.tag_name.clone();
    if !is_newer_version(current_version, &latest_version) {
        return Ok(UpdateInfo {
            current_version: current_version.to_string(),
            latest_version,
            has_update: false,
            download_url: String::new(),
            checksum_url: String::new(),
            release_notes: String::new(),
            asset_name: String::new(),
        });
    }

    let asset_name = platform_asset_name();
    let download_url = release
        .asset_url(&asset_name)
        .ok_or_else(|| anyhow::anyhow!("release has no asset for this platform: {asset_name}"))?
        .to_string();
    let checksum_url = release
        .asset_url(release::CHECKSUM_ASSET)
        .unwrap_or_default()
        .to_string();

    Ok(UpdateInfo {
        current_version: current_version.to_string(),
        latest_version,
        has_update: true,
        download_url: transform_download_url(&download_url, &options.mirror, &options.custom_url),
        checksum_url: if checksum_url.is_empty() {
            checksum_url
        } else {
            transform_download_url(&checksum_url, &options.mirror, &options.custom_url)
        },
        release_notes: release.body,
        asset_name,
    })
}

/// Download, verify, and swap the running executable. The caller decides
/// when to write the marker and exit.
pub async fn perform_update(options: &UpdateOptions, info: &UpdateInfo) -> anyhow::Result<()> {
    info!(version = %info.latest_version, "downloading update");

    let exec_path = std::env::current_exe().context("failed to resolve executable path")?;
    let exec_path = exec_path
        .canonicalize()
        .context("failed to canonicalize executable path")?;

    let staging = StagingDir::create()?;
    let client = build_client(options)?;

    let archive_path = staging.path().join(&info.asset_name);
    download_to(&client, &info.download_url, &archive_path).await?;

    if info.checksum_url.is_empty() {
        warn!("release has no checksum asset, skipping verification");
    } else {
        let checksums_path = staging.path().join("checksums.txt");
        download_to(&client, &info.checksum_url, &checksums_path).await?;
        verify_sha256(&archive_path, &checksums_path, &info.asset_name)
            .context("update archive failed verification")?;
    }

    let new_binary = extract_binary(&archive_path, staging.path())
        .context("failed to extract update archive")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&new_binary, fs::Permissions::from_mode(0o755))?;
    }

    replace_executable(&new_binary, &exec_path).context("failed to replace executable")?;
    info!(path = %exec_path.display(), "executable replaced");
    Ok(())
}

/// Swap the live binary. On Unix the live inode is unlinked first, so the
/// running process keeps its mapped image; on Windows the old file is
/// renamed aside because it cannot be deleted while running.
pub fn replace_executable(new_path: &Path, live_path: &Path) -> anyhow::Result<()> {
    #[cfg(windows)]
    {
        let aside = live_path.with_extension("old");
        fs::rename(live_path, &aside)?;
        if let Err(err) = fs::copy(new_path, live_path) {
            let _ = fs::rename(&aside, live_path);
            return Err(err.into());
        }
        let _ = fs::remove_file(&aside);
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        let live_mode = fs::metadata(live_path)?.permissions();

        let backup = live_path.with_extension("backup");
        fs::copy(live_path, &backup).context("failed to back up current executable")?;

        let restore = |err: anyhow::Error| -> anyhow::Error {
            if let Err(restore_err) = fs::rename(&backup, live_path) {
                return anyhow::anyhow!(
                    "replace failed ({err}) and backup restore failed ({restore_err})"
                );
            }
            err
        };

        if let Err(err) = fs::remove_file(live_path) {
            let _ = fs::remove_file(&backup);
            return Err(anyhow::anyhow!("failed to unlink live executable: {err}"));
        }

        // Rename if the staging dir shares a filesystem, copy otherwise.
        if let Err(rename_err) = fs::rename(new_path, live_path) {
            if let Err(copy_err) = fs::copy(new_path, live_path) {
                return Err(restore(anyhow::anyhow!(
                    "rename failed ({rename_err}), copy failed ({copy_err})"
                )));
            }
        }

        fs::set_permissions(live_path, live_mode)?;
        let _ = fs::remove_file(&backup);
        Ok(())
    }
}

/// `{execDir}/.anssl-updated`; its presence after a clean worker exit makes
/// the supervisor respawn into the new binary.
pub fn update_marker_path() -> anyhow::Result<PathBuf> {
    let exec_path = std::env::current_exe().context("failed to resolve executable path")?;
    let exec_dir = exec_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("executable has no parent directory"))?;
    Ok(exec_dir.join(UPDATE_MARKER))
}

pub fn write_update_marker(version: &str) -> anyhow::Result<()> {
    let path = update_marker_path()?;
    write_update_marker_at(&path, version)
}

pub fn write_update_marker_at(path: &Path, version: &str) -> anyhow::Result<()> {
    let content = format!("{version}\n{}\n", chrono_free_timestamp());
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Remove the marker if present; returns whether it was there.
pub fn consume_update_marker() -> bool {
    match update_marker_path() {
        Ok(path) => consume_update_marker_at(&path),
        Err(_) => false,
    }
}

pub fn consume_update_marker_at(path: &Path) -> bool {
    if path.exists() {
        let _ = fs::remove_file(path);
        true
    } else {
        false
    }
}

/// Unix-seconds stamp without pulling a date dependency into this crate.
fn chrono_free_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn build_client(options: &UpdateOptions) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT);
    if !options.proxy.is_empty() {
        let proxy = reqwest::Proxy::all(&options.proxy)
            .map_err(|err| anyhow::anyhow!("invalid update.proxy: {err}"))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(Into::into)
}

async fn download_to(client: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    let resp = client
        .get(url)
        .header(reqwest::header::USER_AGENT, "anssl-updater")
        .send()
        .await
        .with_context(|| format!("failed to download {url}"))?;
    if !resp.status().is_success() {
        anyhow::bail!("download of {url} failed: status {}", resp.status());
    }
    let bytes = resp.bytes().await?;
    fs::write(dest, &bytes).with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(())
}

/// Temp directory removed on drop, whatever path the update takes.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create() -> anyhow::Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "anssl-update-{}-{}",
            std::process::id(),
            chrono_free_timestamp()
        ));
        fs::create_dir_all(&path).context("failed to create update staging directory")?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
