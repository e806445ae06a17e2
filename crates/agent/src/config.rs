use std::fs;
use std::path::Path;

use serde::Deserialize;

pub const URL_PROD: &str = "https://anssl.cn/deploy";
pub const URL_LOCAL: &str = "http://localhost:9000/deploy";

/// Environment override for the control service URL; takes precedence over
/// `server.env`.
pub const SERVER_URL_ENV: &str = "ANSSL_SERVER_URL";

const VALID_MIRRORS: &[&str] = &["github", "ghproxy", "ghproxy2", "custom"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ssl: SslConfig,
    pub update: UpdateConfig,
    pub provider: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub access_key: String,
    /// Empty for production; "local" points the agent at a service on
    /// localhost for development.
    pub env: String,
    /// Loopback port for the HTTP-01 responder.
    pub port: u16,
    /// Loopback port for the Prometheus endpoint; 0 disables it.
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            env: String::new(),
            port: 19000,
            metrics_port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub nginx_path: String,
    pub apache_path: String,
    #[serde(rename = "rustFSPath")]
    pub rust_fs_path: String,
    pub fei_niu_enabled: bool,
    pub one_panel: Option<OnePanelConfig>,
}

impl SslConfig {
    pub fn one_panel_enabled(&self) -> bool {
        self.one_panel
            .as_ref()
            .map(|p| !p.url.is_empty())
            .unwrap_or(false)
    }

    /// True when no install target is configured at all; a deployment then
    /// stops after the download.
    pub fn no_targets(&self) -> bool {
        self.nginx_path.is_empty()
            && self.apache_path.is_empty()
            && self.rust_fs_path.is_empty()
            && !self.fei_niu_enabled
            && !self.one_panel_enabled()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnePanelConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateConfig {
    /// github | ghproxy | ghproxy2 | custom; empty falls back to ghproxy.
    pub mirror: String,
    pub custom_url: String,
    pub proxy: String,
}

/// One third-party certificate service with its credential bag. Which
/// fields are meaningful depends on `name` (aliyun, qiniu, cloudTencent).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub name: String,
    pub remark: String,
    // aliyun
    pub access_key_id: String,
    pub access_key_secret: String,
    pub esa_site_id: String,
    // qiniu
    pub access_key: String,
    pub access_secret: String,
    // cloudTencent
    pub secret_id: String,
    pub secret_key: String,
}

impl AppConfig {
    /// Load the YAML config from `path` and validate it. Configured SSL
    /// directories are created (0755) if missing.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read config {}: {}", path.display(), err))?;
        let cfg: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|err| anyhow::anyhow!("invalid config {}: {}", path.display(), err))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.access_key.is_empty() {
            anyhow::bail!("server.accessKey cannot be empty");
        }

        for dir in [
            &self.ssl.nginx_path,
            &self.ssl.apache_path,
            &self.ssl.rust_fs_path,
        ] {
            if !dir.is_empty() {
                fs::create_dir_all(dir).map_err(|err| {
                    anyhow::anyhow!("failed to create ssl directory {}: {}", dir, err)
                })?;
            }
        }

        if !self.update.mirror.is_empty() {
            if !VALID_MIRRORS.contains(&self.update.mirror.as_str()) {
                anyhow::bail!(
                    "unsupported update.mirror: {} (expected one of: github, ghproxy, ghproxy2, custom)",
                    self.update.mirror
                );
            }
            if self.update.mirror == "custom" && self.update.custom_url.is_empty() {
                anyhow::bail!("update.customUrl is required when update.mirror is custom");
            }
        }

        Ok(())
    }

    /// Base URL of the central service for this environment.
    pub fn server_url(&self) -> String {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.is_empty() {
                return url;
            }
        }
        if self.server.env == "local" {
            URL_LOCAL.to_string()
        } else {
            URL_PROD.to_string()
        }
    }

    pub fn find_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.provider.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, content).expect("write config");
        (dir, path)
    }

    #[test]
    fn load_parses_full_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nginx_path = dir.path().join("nginx-ssl");
        let raw = format!(
            r#"
server:
  accessKey: ak-123
  env: local
  port: 19001
ssl:
  nginxPath: {}
  feiNiuEnabled: true
  onePanel:
    url: http://panel.local:8080
    apiKey: panel-key
update:
  mirror: custom
  customUrl: https://mirror.internal
provider:
  - name: aliyun
    remark: prod account
    accessKeyId: id
    accessKeySecret: secret
    esaSiteId: "123"
  - name: qiniu
    remark: cdn
    accessKey: qak
    accessSecret: qsk
"#,
            nginx_path.display()
        );
        let (_dir, path) = write_config(&raw);

        let cfg = AppConfig::load(&path).expect("load");
        assert_eq!(cfg.server.access_key, "ak-123");
        assert_eq!(cfg.server.port, 19001);
        assert_eq!(cfg.server_url(), URL_LOCAL);
        assert!(cfg.ssl.fei_niu_enabled);
        assert!(cfg.ssl.one_panel_enabled());
        assert!(nginx_path.is_dir(), "ssl dir should be created");
        assert_eq!(cfg.provider.len(), 2);
        assert_eq!(
            cfg.find_provider("aliyun").map(|p| p.esa_site_id.as_str()),
            Some("123")
        );
        assert!(cfg.find_provider("missing").is_none());
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let (_dir, path) = write_config("server:\n  accessKey: ak\n");
        let cfg = AppConfig::load(&path).expect("load");
        assert_eq!(cfg.server.port, 19000);
        assert_eq!(cfg.server.metrics_port, 0);
        assert_eq!(cfg.server_url(), URL_PROD);
        assert!(cfg.ssl.no_targets());
        assert!(cfg.provider.is_empty());
    }

    #[test]
    fn missing_access_key_is_rejected() {
        let (_dir, path) = write_config("server:\n  env: local\n");
        let err = AppConfig::load(&path).expect_err("should fail");
        assert!(err.to_string().contains("accessKey"));
    }

    #[test]
    fn custom_mirror_requires_custom_url() {
        let (_dir, path) = write_config("server:\n  accessKey: ak\nupdate:\n  mirror: custom\n");
        let err = AppConfig::load(&path).expect_err("should fail");
        assert!(err.to_string().contains("customUrl"));
    }

    #[test]
    fn unknown_mirror_is_rejected() {
        let (_dir, path) = write_config("server:\n  accessKey: ak\nupdate:\n  mirror: fastgit\n");
        let err = AppConfig::load(&path).expect_err("should fail");
        assert!(err.to_string().contains("unsupported update.mirror"));
    }
}
