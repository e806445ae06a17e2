//! Certificate deployment pipeline.
//!
//! Download the issued bundle, extract it into a private scratch directory,
//! fan out to the configured install targets, and reload the affected
//! servers. The scratch directory and the downloaded zip are removed on
//! every exit path; a target directory is either fully replaced or left as
//! it was.

mod apache;
mod feiniu;
mod nginx;
mod onepanel;
mod rustfs;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::SslConfig;
use crate::telemetry;

pub use nginx::nginx_ssl_config;
pub use apache::apache_ssl_config;

pub const CERTS_DIR: &str = "certs";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "privateKey.key";
pub const FEINIU_FIXED_PATH: &str = "/usr/trim/var/trim_connect/ssls";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Wildcard labels cannot be directory names; `*` becomes `_`.
pub fn sanitize_domain(domain: &str) -> String {
    domain.replace('*', "_")
}

pub struct CertDeployer {
    ssl: SslConfig,
    http: reqwest::Client,
    access_key: String,
    work_dir: PathBuf,
}

/// Scratch state for one deployment; dropping it removes both the extracted
/// directory and the downloaded zip.
struct Workspace {
    zip_path: PathBuf,
    extract_dir: PathBuf,
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.extract_dir);
        let _ = fs::remove_file(&self.zip_path);
    }
}

impl CertDeployer {
    pub fn new(ssl: SslConfig, http: reqwest::Client, access_key: String) -> Self {
        Self {
            ssl,
            http,
            access_key,
            work_dir: PathBuf::from(CERTS_DIR),
        }
    }

    /// Override the scratch directory (defaults to `./certs`).
    pub fn with_work_dir(mut self, work_dir: impl AsRef<Path>) -> Self {
        self.work_dir = work_dir.as_ref().to_path_buf();
        self
    }

    /// Default deployment: install into every configured local target.
    pub async fn deploy_all(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        let safe_domain = sanitize_domain(domain);
        let zip_path = self.download_bundle(&safe_domain, url).await?;

        if self.ssl.no_targets() {
            info!(zip = %zip_path.display(), "no ssl targets configured, bundle downloaded only");
            let _ = fs::remove_file(&zip_path);
            return Ok(());
        }

        let workspace = self.extract_bundle(zip_path, &safe_domain)?;

        // nginx installs last: its rename consumes the scratch directory,
        // every other target reads or copies out of it.
        if !self.ssl.apache_path.is_empty() {
            apache::install(
                &workspace.extract_dir,
                Path::new(&self.ssl.apache_path),
                &safe_domain,
            )
            .context("deploy to apache failed")?;
            telemetry::record_deployment("apache", "success");
        }

        if !self.ssl.rust_fs_path.is_empty() {
            rustfs::install(
                &workspace.extract_dir,
                Path::new(&self.ssl.rust_fs_path),
                &safe_domain,
            )
            .context("deploy to rustfs failed")?;
            telemetry::record_deployment("rustfs", "success");
        }

        if self.ssl.fei_niu_enabled {
            feiniu::install(
                &workspace.extract_dir,
                Path::new(FEINIU_FIXED_PATH),
                domain,
            )
            .await
            .context("deploy to feiniu failed")?;
            telemetry::record_deployment("feiniu", "success");
        }

        if self.ssl.one_panel_enabled() {
            if let Some(panel) = &self.ssl.one_panel {
                onepanel::upload(&self.http, panel, &workspace.extract_dir, domain)
                    .await
                    .context("deploy to 1panel failed")?;
                telemetry::record_deployment("1panel", "success");
            }
        }

        if !self.ssl.nginx_path.is_empty() {
            nginx::install(
                &workspace.extract_dir,
                Path::new(&self.ssl.nginx_path),
                &safe_domain,
            )
            .context("deploy to nginx failed")?;
            telemetry::record_deployment("nginx", "success");
        }

        drop(workspace);

        if !self.ssl.nginx_path.is_empty() {
            nginx::test_and_reload().await;
        }
        if !self.ssl.apache_path.is_empty() {
            apache::test_and_reload().await;
        }

        info!(domain, "deployment finished");
        Ok(())
    }

    pub async fn deploy_nginx(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        if self.ssl.nginx_path.is_empty() {
            anyhow::bail!("nginx ssl directory not configured (ssl.nginxPath)");
        }
        let safe_domain = sanitize_domain(domain);
        let workspace = self.fetch(&safe_domain, url).await?;

        nginx::install(
            &workspace.extract_dir,
            Path::new(&self.ssl.nginx_path),
            &safe_domain,
        )
        .context("deploy to nginx failed")?;
        drop(workspace);

        nginx::test_and_reload().await;
        telemetry::record_deployment("nginx", "success");
        info!(domain, "nginx deployment finished");
        Ok(())
    }

    pub async fn deploy_apache(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        if self.ssl.apache_path.is_empty() {
            anyhow::bail!("apache ssl directory not configured (ssl.apachePath)");
        }
        let safe_domain = sanitize_domain(domain);
        let workspace = self.fetch(&safe_domain, url).await?;

        apache::install(
            &workspace.extract_dir,
            Path::new(&self.ssl.apache_path),
            &safe_domain,
        )
        .context("deploy to apache failed")?;
        drop(workspace);

        apache::test_and_reload().await;
        telemetry::record_deployment("apache", "success");
        info!(domain, "apache deployment finished");
        Ok(())
    }

    pub async fn deploy_rustfs(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        if self.ssl.rust_fs_path.is_empty() {
            anyhow::bail!("rustfs tls directory not configured (ssl.rustFSPath)");
        }
        let safe_domain = sanitize_domain(domain);
        let workspace = self.fetch(&safe_domain, url).await?;

        rustfs::install(
            &workspace.extract_dir,
            Path::new(&self.ssl.rust_fs_path),
            &safe_domain,
        )
        .context("deploy to rustfs failed")?;

        telemetry::record_deployment("rustfs", "success");
        info!(domain, "rustfs deployment finished");
        Ok(())
    }

    pub async fn deploy_one_panel(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        let panel = match &self.ssl.one_panel {
            Some(panel) if !panel.url.is_empty() => panel.clone(),
            _ => anyhow::bail!("1panel not configured (ssl.onePanel.url)"),
        };
        let safe_domain = sanitize_domain(domain);
        let workspace = self.fetch(&safe_domain, url).await?;

        onepanel::upload(&self.http, &panel, &workspace.extract_dir, domain)
            .await
            .context("deploy to 1panel failed")?;

        telemetry::record_deployment("1panel", "success");
        info!(domain, "1panel upload finished");
        Ok(())
    }

    pub async fn deploy_feiniu(&self, domain: &str, url: &str) -> anyhow::Result<()> {
        if !self.ssl.fei_niu_enabled {
            anyhow::bail!("feiniu deployment not enabled (ssl.feiNiuEnabled)");
        }
        let safe_domain = sanitize_domain(domain);
        let workspace = self.fetch(&safe_domain, url).await?;

        feiniu::install(&workspace.extract_dir, Path::new(FEINIU_FIXED_PATH), domain)
            .await
            .context("deploy to feiniu failed")?;

        telemetry::record_deployment("feiniu", "success");
        info!(domain, "feiniu deployment finished");
        Ok(())
    }

    async fn fetch(&self, safe_domain: &str, url: &str) -> anyhow::Result<Workspace> {
        let zip_path = self.download_bundle(safe_domain, url).await?;
        self.extract_bundle(zip_path, safe_domain)
    }

    async fn download_bundle(&self, safe_domain: &str, url: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.work_dir).context("failed to create certs directory")?;
        let zip_path = self
            .work_dir
            .join(format!("{safe_domain}_certificates.zip"));
        download_file(&self.http, &self.access_key, url, &zip_path).await?;
        info!(file = %zip_path.display(), "certificate bundle downloaded");
        Ok(zip_path)
    }

    fn extract_bundle(&self, zip_path: PathBuf, safe_domain: &str) -> anyhow::Result<Workspace> {
        let extract_dir = self.work_dir.join(safe_domain);
        let workspace = Workspace {
            zip_path,
            extract_dir,
        };
        extract_zip(&workspace.zip_path, &workspace.extract_dir)
            .context("failed to extract certificate bundle")?;
        Ok(workspace)
    }
}

/// Authenticated download to `dest`. The payload lands in an `.anssl-*`
/// temp file in the target directory and is renamed in only after fsync, so
/// a torn download never shadows the real name.
pub async fn download_file(
    http: &reqwest::Client,
    access_key: &str,
    url: &str,
    dest: &Path,
) -> anyhow::Result<()> {
    let mut parsed = reqwest::Url::parse(url).context("invalid download URL")?;
    parsed
        .query_pairs_mut()
        .append_pair("accessKey", access_key);

    let resp = http
        .get(parsed)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .context("download request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("download failed with status {}", resp.status());
    }
    let body = resp.bytes().await.context("download body read failed")?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = dest.with_file_name(format!(
        ".anssl-{}",
        dest.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download")
    ));

    let result = (|| -> anyhow::Result<()> {
        let mut tmp = fs::File::create(&tmp_path)?;
        std::io::Write::write_all(&mut tmp, &body)?;
        tmp.sync_all()?;
        drop(tmp);

        // Windows cannot rename over an existing file.
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        fs::rename(&tmp_path, dest)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Extract a zip bundle, refusing any entry whose normalized path escapes
/// the extraction root. File modes from the archive are preserved.
pub fn extract_zip(zip_path: &Path, extract_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(extract_dir).context("failed to create extraction directory")?;

    let file = fs::File::open(zip_path).context("failed to open zip file")?;
    let mut archive = zip::ZipArchive::new(file).context("failed to read zip file")?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow::anyhow!("unsafe path in archive: {name}"))?;
        let target = extract_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

/// Recursive copy preserving file modes and directory structure.
pub fn copy_directory(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_directory(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub fn copy_file_with_mode(src: &Path, dst: &Path, mode: u32) -> anyhow::Result<()> {
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Replace `{target_root}/{folder}` with the contents of `source`. Rename
/// is preferred; a cross-device error falls back to copy + delete.
pub fn move_certificates(source: &Path, target_root: &Path, folder: &str) -> anyhow::Result<()> {
    fs::create_dir_all(target_root).context("failed to create ssl directory")?;
    let target = target_root.join(folder);

    if target.exists() {
        fs::remove_dir_all(&target).context("failed to remove existing certificate directory")?;
    }

    match fs::rename(source, &target) {
        Ok(()) => {}
        Err(err) if is_cross_device(&err) => {
            copy_directory(source, &target).context("failed to copy certificate directory")?;
            fs::remove_dir_all(source).context("failed to clean up extraction directory")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("failed to move certificate directory: {err}"));
        }
    }

    info!(path = %target.display(), "certificate directory updated");
    Ok(())
}

fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// `exec.LookPath` equivalent: first executable named `binary` on PATH.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Run an external command with combined output and a 10 s deadline.
pub async fn run_command(binary: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new(binary).args(args).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("{binary} timed out after {}s", COMMAND_TIMEOUT.as_secs()))?
    .with_context(|| format!("failed to run {binary}"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        anyhow::bail!("{binary} {:?} failed: {}", args, combined.trim());
    }
    Ok(combined)
}

/// Best-effort variant: failures are logged, never propagated.
pub async fn run_command_logged(binary: &str, args: &[&str]) {
    if let Err(err) = run_command(binary, args).await {
        warn!(?err, binary, "external command failed");
    }
}
