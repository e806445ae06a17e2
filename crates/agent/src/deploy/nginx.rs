//! Nginx target: install the certificate directory and generate an
//! includeable SSL snippet, then `nginx -t` / `nginx -s reload`.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use super::{find_in_path, move_certificates, run_command, CERT_FILE, KEY_FILE};

pub(super) fn install(source: &Path, nginx_root: &Path, safe_domain: &str) -> anyhow::Result<()> {
    move_certificates(source, nginx_root, safe_domain)?;
    write_ssl_config(nginx_root, safe_domain)?;
    Ok(())
}

fn write_ssl_config(nginx_root: &Path, safe_domain: &str) -> anyhow::Result<()> {
    let cert_dir = nginx_root.join(safe_domain);
    let config_path = cert_dir.join(format!("{safe_domain}.ssl.conf"));
    let content = nginx_ssl_config(&cert_dir, safe_domain);

    fs::write(&config_path, content).context("failed to write nginx ssl config")?;
    info!(file = %config_path.display(), "nginx ssl config generated");
    Ok(())
}

/// Snippet meant to be `include`d inside a server block.
pub fn nginx_ssl_config(cert_dir: &Path, safe_domain: &str) -> String {
    let config_path = cert_dir.join(format!("{safe_domain}.ssl.conf"));
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    format!(
        r#"# SSL certificate - {safe_domain}
# Include this file inside a server block:
#   include {config};

ssl_certificate {cert};
ssl_certificate_key {key};

ssl_protocols TLSv1.2 TLSv1.3;
ssl_ciphers ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384;
ssl_prefer_server_ciphers off;

ssl_session_cache shared:SSL:10m;
ssl_session_timeout 1d;
ssl_session_tickets off;
"#,
        config = config_path.display(),
        cert = cert_path.display(),
        key = key_path.display(),
    )
}

pub(super) fn is_available() -> bool {
    find_in_path("nginx").is_some()
}

/// Config-test then reload. Both are warnings on failure: the files are
/// already installed, the operator can reload by hand.
pub(super) async fn test_and_reload() {
    if !is_available() {
        info!("nginx not found in PATH, skipping config test and reload");
        return;
    }

    if let Err(err) = run_command("nginx", &["-t"]).await {
        warn!(?err, "nginx config test failed");
        return;
    }

    match run_command("nginx", &["-s", "reload"]).await {
        Ok(_) => info!("nginx reloaded"),
        Err(err) => warn!(?err, "nginx reload failed, reload manually"),
    }
}
