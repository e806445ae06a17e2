//! Release resolution: the GitHub release manifest, mirror rewriting for
//! hosts that cannot reach github.com directly, and version comparison.

use serde::Deserialize;

pub const GITHUB_REPO: &str = "https-cert/anssl";
pub const CHECKSUM_ASSET: &str = "checksums.txt";

const MIRROR_GITHUB: &str = "github";
const MIRROR_GHPROXY: &str = "ghproxy";
const MIRROR_GHPROXY2: &str = "ghproxy2";
const MIRROR_CUSTOM: &str = "custom";

const GITHUB_PREFIX: &str = "https://github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl GitHubRelease {
    pub fn asset_url(&self, name: &str) -> Option<&str> {
        self.assets
            .iter()
            .find(|asset| asset.name == name)
            .map(|asset| asset.browser_download_url.as_str())
    }
}

pub fn release_api_url(api_base: &str) -> String {
    format!(
        "{}/repos/{}/releases/latest",
        api_base.trim_end_matches('/'),
        GITHUB_REPO
    )
}

pub async fn fetch_latest_release(
    client: &reqwest::Client,
    api_base: &str,
) -> anyhow::Result<GitHubRelease> {
    let url = release_api_url(api_base);
    let resp = client
        .get(&url)
        .header(reqwest::header::USER_AGENT, "anssl-updater")
        .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
        .send()
        .await
        .map_err(|err| anyhow::anyhow!("failed to fetch release metadata from {url}: {err}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("release metadata request failed: status {}", resp.status());
    }

    Ok(resp.json().await?)
}

/// Archive asset name for this platform. Unix platforms ship tar.gz,
/// Windows ships zip.
pub fn platform_asset_name() -> String {
    asset_name_for(std::env::consts::OS, std::env::consts::ARCH)
}

pub fn asset_name_for(os: &str, arch: &str) -> String {
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    let extension = if os == "windows" { "zip" } else { "tar.gz" };
    format!("anssl-{os}-{arch}.{extension}")
}

/// Rewrite a github.com download URL through the configured mirror. An
/// empty mirror setting means the default accelerated mirror; `github`
/// means no rewrite at all.
pub fn transform_download_url(original: &str, mirror: &str, custom_url: &str) -> String {
    let target = match mirror {
        MIRROR_GITHUB => return original.to_string(),
        MIRROR_CUSTOM if !custom_url.is_empty() => custom_url.trim_end_matches('/').to_string(),
        MIRROR_GHPROXY2 => "https://gh-proxy.com/https://github.com".to_string(),
        MIRROR_GHPROXY | "" => "https://ghproxy.net/https://github.com".to_string(),
        _ => return original.to_string(),
    };
    original.replacen(GITHUB_PREFIX, &target, 1)
}

/// True when `latest` is newer than `current`. Both sides are parsed as
/// semver where possible; otherwise any difference counts as an update.
pub fn is_newer_version(current: &str, latest: &str) -> bool {
    let current_trimmed = current.trim().trim_start_matches('v');
    let latest_trimmed = latest.trim().trim_start_matches('v');

    match (
        semver::Version::parse(current_trimmed),
        semver::Version::parse(latest_trimmed),
    ) {
        (Ok(current_version), Ok(latest_version)) => latest_version > current_version,
        _ => current_trimmed != latest_trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_api_url_targets_latest() {
        assert_eq!(
            release_api_url("https://api.github.com"),
            "https://api.github.com/repos/https-cert/anssl/releases/latest"
        );
    }

    #[test]
    fn asset_names_map_arch_aliases() {
        assert_eq!(asset_name_for("linux", "x86_64"), "anssl-linux-amd64.tar.gz");
        assert_eq!(asset_name_for("linux", "aarch64"), "anssl-linux-arm64.tar.gz");
        assert_eq!(asset_name_for("darwin", "aarch64"), "anssl-darwin-arm64.tar.gz");
        assert_eq!(asset_name_for("windows", "x86_64"), "anssl-windows-amd64.zip");
        assert_eq!(
            asset_name_for("freebsd", "riscv64"),
            "anssl-freebsd-riscv64.tar.gz"
        );
    }

    #[test]
    fn mirror_rewrites_github_prefix() {
        let original = "https://github.com/https-cert/anssl/releases/download/v1.0.0/anssl-linux-amd64.tar.gz";

        assert_eq!(transform_download_url(original, "github", ""), original);
        assert_eq!(
            transform_download_url(original, "", ""),
            "https://ghproxy.net/https://github.com/https-cert/anssl/releases/download/v1.0.0/anssl-linux-amd64.tar.gz"
        );
        assert_eq!(
            transform_download_url(original, "ghproxy2", ""),
            "https://gh-proxy.com/https://github.com/https-cert/anssl/releases/download/v1.0.0/anssl-linux-amd64.tar.gz"
        );
        assert_eq!(
            transform_download_url(original, "custom", "https://mirror.internal/"),
            "https://mirror.internal/https-cert/anssl/releases/download/v1.0.0/anssl-linux-amd64.tar.gz"
        );
        // Unknown mirror values leave the URL untouched.
        assert_eq!(transform_download_url(original, "bogus", ""), original);
    }

    #[test]
    fn version_comparison_uses_semver() {
        assert!(is_newer_version("v0.3.0", "v0.3.1"));
        assert!(is_newer_version("0.3.0", "v1.0.0"));
        assert!(!is_newer_version("v0.3.1", "v0.3.1"));
        assert!(!is_newer_version("v1.0.0", "v0.9.9"));
        // Pre-releases sort below their release.
        assert!(is_newer_version("v1.0.0-beta.1", "v1.0.0"));
    }

    #[test]
    fn version_comparison_falls_back_to_inequality() {
        assert!(is_newer_version("weird-build", "other-build"));
        assert!(!is_newer_version("weird-build", "weird-build"));
    }

    #[test]
    fn asset_lookup_finds_by_name() {
        let release = GitHubRelease {
            tag_name: "v1.0.0".into(),
            name: String::new(),
            body: String::new(),
            assets: vec![ReleaseAsset {
                name: "anssl-linux-amd64.tar.gz".into(),
                browser_download_url: "https://github.com/x".into(),
                size: 10,
            }],
        };
        assert_eq!(
            release.asset_url("anssl-linux-amd64.tar.gz"),
            Some("https://github.com/x")
        );
        assert!(release.asset_url("missing").is_none());
    }
}
