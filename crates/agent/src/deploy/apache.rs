//! Apache target: copy the certificate directory, generate an Include
//! snippet, and gracefully reload through whichever control binary exists.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use super::{copy_directory, find_in_path, run_command, CERT_FILE, KEY_FILE};

const APACHE_COMMANDS: &[&str] = &["apachectl", "apache2ctl", "httpd"];

pub(super) fn install(source: &Path, apache_root: &Path, safe_domain: &str) -> anyhow::Result<()> {
    let target = apache_root.join(safe_domain);
    if target.exists() {
        fs::remove_dir_all(&target).context("failed to remove existing apache cert directory")?;
    }
    copy_directory(source, &target).context("failed to copy certificates to apache")?;
    info!(path = %target.display(), "certificates installed for apache");

    write_ssl_config(apache_root, safe_domain)?;
    Ok(())
}

fn write_ssl_config(apache_root: &Path, safe_domain: &str) -> anyhow::Result<()> {
    let cert_dir = apache_root.join(safe_domain);
    let config_path = cert_dir.join(format!("{safe_domain}.ssl.conf"));
    let content = apache_ssl_config(&cert_dir, safe_domain);

    fs::write(&config_path, content).context("failed to write apache ssl config")?;
    info!(file = %config_path.display(), "apache ssl config generated");
    Ok(())
}

/// Snippet meant to be `Include`d inside a VirtualHost block.
pub fn apache_ssl_config(cert_dir: &Path, safe_domain: &str) -> String {
    let config_path = cert_dir.join(format!("{safe_domain}.ssl.conf"));
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    format!(
        r#"# Apache SSL certificate - {safe_domain}
# Include this file inside a VirtualHost block:
#   <VirtualHost *:443>
#       ServerName {safe_domain}
#       Include {config}
#   </VirtualHost>

SSLEngine on
SSLCertificateFile {cert}
SSLCertificateKeyFile {key}

SSLProtocol all -SSLv3 -TLSv1 -TLSv1.1

SSLCipherSuite ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384
SSLHonorCipherOrder off

SSLSessionTickets off
"#,
        config = config_path.display(),
        cert = cert_path.display(),
        key = key_path.display(),
    )
}

fn control_command() -> Option<&'static str> {
    APACHE_COMMANDS
        .iter()
        .copied()
        .find(|cmd| find_in_path(cmd).is_some())
}

pub(super) async fn test_and_reload() {
    let Some(cmd) = control_command() else {
        info!("apache not found in PATH, skipping config test and reload");
        return;
    };

    if let Err(err) = run_command(cmd, &["-t"]).await {
        warn!(?err, "apache config test failed");
        return;
    }

    // Some distributions only understand `-k graceful`.
    if run_command(cmd, &["graceful"]).await.is_ok() {
        info!("apache reloaded");
        return;
    }
    match run_command(cmd, &["-k", "graceful"]).await {
        Ok(_) => info!("apache reloaded"),
        Err(err) => warn!(?err, "apache reload failed, reload manually"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_copies_files_and_writes_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("scratch");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join(CERT_FILE), b"CERT").expect("write cert");
        fs::write(source.join(KEY_FILE), b"KEY").expect("write key");

        let root = dir.path().join("apache-ssl");
        install(&source, &root, "a.example").expect("install");

        let target = root.join("a.example");
        assert_eq!(fs::read(target.join(CERT_FILE)).expect("cert"), b"CERT");
        assert!(target.join("a.example.ssl.conf").exists());
        // Apache copies; the scratch dir stays for the remaining targets.
        assert!(source.exists());
    }

    #[test]
    fn install_replaces_previous_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("scratch");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join(CERT_FILE), b"NEW").expect("write");

        let root = dir.path().join("apache-ssl");
        let target = root.join("a.example");
        fs::create_dir_all(&target).expect("mkdir");
        fs::write(target.join("leftover"), b"x").expect("write");

        install(&source, &root, "a.example").expect("install");
        assert!(!target.join("leftover").exists());
        assert_eq!(fs::read(target.join(CERT_FILE)).expect("read"), b"NEW");
    }

    #[test]
    fn ssl_config_uses_apache_directives() {
        let content = apache_ssl_config(Path::new("/etc/apache2/ssl/a.example"), "a.example");
        assert!(content.contains("SSLCertificateFile /etc/apache2/ssl/a.example/cert.pem"));
        assert!(
            content.contains("SSLCertificateKeyFile /etc/apache2/ssl/a.example/privateKey.key")
        );
        assert!(content.contains("SSLEngine on"));
    }
}
