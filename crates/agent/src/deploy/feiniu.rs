//! FeiNiu (fnOS) appliance target.
//!
//! The appliance keeps certificates under a fixed path, tracks them in a
//! `trim_connect` Postgres database, and routes them through its own nginx
//! config file. Only the file install is a hard failure; the database,
//! config and service steps are best-effort because they depend on the
//! appliance being a real fnOS box.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use super::{copy_file_with_mode, run_command, run_command_logged, CERT_FILE, KEY_FILE};

const FEINIU_NGINX_CONFIG: &str = "/usr/trim/etc/network_gateway_cert.conf";
const FEINIU_SERVICES: &[&str] = &["webdav.service", "smbftpd.service", "trim_nginx.service"];
const CERT_VALIDITY_DAYS: i64 = 90;

pub(super) async fn install(source: &Path, feiniu_root: &Path, domain: &str) -> anyhow::Result<()> {
    let timestamp = Utc::now().timestamp();
    let domain_dir = feiniu_root.join(domain);
    let target = domain_dir.join(timestamp.to_string());

    if domain_dir.exists() {
        info!(path = %domain_dir.display(), "removing previous feiniu certificate directory");
        if let Err(err) = fs::remove_dir_all(&domain_dir) {
            if is_permission_error(&err) {
                warn!(?err, "plain removal failed, retrying with sudo");
                run_command("sudo", &["rm", "-rf", &domain_dir.to_string_lossy()])
                    .await
                    .context("failed to remove previous feiniu certificate directory")?;
            } else {
                return Err(anyhow::anyhow!(
                    "failed to remove previous feiniu certificate directory: {err}"
                ));
            }
        }
    }

    fs::create_dir_all(&target).map_err(|err| permission_hint(err, feiniu_root))?;

    let cert_dst = target.join(format!("{domain}.crt"));
    let key_dst = target.join(format!("{domain}.key"));
    copy_file_with_mode(&source.join(CERT_FILE), &cert_dst, 0o755)
        .map_err(|err| anyhow::anyhow!("failed to install certificate: {err}"))?;
    copy_file_with_mode(&source.join(KEY_FILE), &key_dst, 0o755)
        .map_err(|err| anyhow::anyhow!("failed to install private key: {err}"))?;
    info!(path = %target.display(), "certificates installed for feiniu");

    // fnOS reads the files as group root.
    if let Err(err) = change_group_to_root(&target).await {
        warn!(?err, path = %target.display(), "failed to set group root on certificate directory");
    }

    let valid_from = timestamp * 1000;
    let valid_to = (timestamp + CERT_VALIDITY_DAYS * 24 * 60 * 60) * 1000;
    if let Err(err) = update_database(domain, &target, valid_from, valid_to).await {
        warn!(?err, domain, "failed to update feiniu certificate database");
    }

    if let Err(err) = update_nginx_config(domain, &target) {
        warn!(?err, domain, "failed to update feiniu nginx config");
    }

    restart_services().await;

    info!(domain, path = %target.display(), "feiniu deployment finished");
    Ok(())
}

async fn change_group_to_root(target: &Path) -> anyhow::Result<()> {
    let path = target.to_string_lossy();
    if run_command("chgrp", &["-R", "root", &path]).await.is_ok() {
        return Ok(());
    }
    warn!("plain chgrp failed, retrying with sudo");
    run_command("sudo", &["chgrp", "-R", "root", &path])
        .await
        .map(|_| ())
}

/// Upsert the certificate row via `psql`. The appliance schema stores file
/// paths, validity in milliseconds, and a free-form description.
async fn update_database(
    domain: &str,
    cert_dir: &Path,
    valid_from: i64,
    valid_to: i64,
) -> anyhow::Result<()> {
    let cert_file = cert_dir.join(format!("{domain}.crt"));
    let key_file = cert_dir.join(format!("{domain}.key"));
    let now_millis = Utc::now().timestamp_millis();

    let (encrypt_type, issued_by) = inspect_certificate(&cert_file).await;

    let check_sql = format!("SELECT domain FROM cert WHERE domain = '{domain}';");
    let existing = run_command(
        "psql",
        &[
            "-t", "-A", "-U", "postgres", "-d", "trim_connect", "-c", &check_sql,
        ],
    )
    .await
    .map(|out| !out.trim().is_empty())
    .unwrap_or(false);

    if existing {
        let update_sql = format!(
            "UPDATE cert SET \
             valid_from = {valid_from}, valid_to = {valid_to}, \
             encrypt_type = '{encrypt_type}', issued_by = '{issued_by}', \
             last_renew_time = {now_millis}, des = 'deployed by anssl', \
             private_key = '{key}', certificate = '{cert}', issuer_certificate = '', \
             status = 'suc', updated_time = {now_millis} \
             WHERE domain = '{domain}';",
            key = key_file.display(),
            cert = cert_file.display(),
        );
        run_command(
            "psql",
            &["-U", "postgres", "-d", "trim_connect", "-c", &update_sql],
        )
        .await
        .context("psql update failed")?;
        info!(domain, "feiniu certificate row updated");
    } else {
        let next_id = run_command(
            "psql",
            &[
                "-t",
                "-A",
                "-U",
                "postgres",
                "-d",
                "trim_connect",
                "-c",
                "SELECT COALESCE(MAX(id), 0) + 1 FROM cert;",
            ],
        )
        .await
        .context("failed to allocate certificate row id")?;
        let next_id = next_id.trim().to_string();

        let insert_sql = format!(
            "INSERT INTO cert VALUES ({next_id}, '{domain}', '*{domain},{domain}', \
             {valid_from}, {valid_to}, '{encrypt_type}', '{issued_by}', {now_millis}, \
             'deployed by anssl', 0, null, 'upload', null, \
             '{key}', '{cert}', '', 'suc', {now_millis}, {now_millis});",
            key = key_file.display(),
            cert = cert_file.display(),
        );
        run_command(
            "psql",
            &["-U", "postgres", "-d", "trim_connect", "-c", &insert_sql],
        )
        .await
        .context("psql insert failed")?;
        info!(domain, "feiniu certificate row inserted");
    }

    Ok(())
}

/// Key type and issuer via `openssl x509`, with safe defaults when the tool
/// is unavailable.
async fn inspect_certificate(cert_file: &Path) -> (String, String) {
    let mut encrypt_type = "RSA".to_string();
    let mut issued_by = "Let's Encrypt".to_string();

    let path = cert_file.to_string_lossy();
    if let Ok(text) = run_command("openssl", &["x509", "-in", &path, "-noout", "-text"]).await {
        if text.contains("ECDSA") || text.contains("ECC") || text.contains("id-ecPublicKey") {
            encrypt_type = "ECDSA".to_string();
        }
        if let Ok(issuer) = run_command("openssl", &["x509", "-in", &path, "-noout", "-issuer"]).await
        {
            if let Some(last) = issuer.rsplit('=').next() {
                let trimmed = last.trim();
                if !trimmed.is_empty() {
                    issued_by = trimmed.to_string();
                }
            }
        }
    }

    (encrypt_type, issued_by)
}

/// Point the appliance's gateway config at the new files: replace the entry
/// with a matching host, otherwise prepend a new one.
fn update_nginx_config(domain: &str, cert_dir: &Path) -> anyhow::Result<()> {
    update_nginx_config_at(Path::new(FEINIU_NGINX_CONFIG), domain, cert_dir)
}

fn update_nginx_config_at(config_file: &Path, domain: &str, cert_dir: &Path) -> anyhow::Result<()> {
    let backup = config_file.with_file_name(format!(
        "{}.{}.bak",
        config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Utc::now().timestamp()
    ));
    if let Err(err) = fs::copy(config_file, &backup) {
        warn!(?err, "failed to back up feiniu nginx config");
    }

    let content =
        fs::read_to_string(config_file).context("failed to read feiniu nginx config")?;

    let cert_file = cert_dir.join(format!("{domain}.crt"));
    let key_file = cert_dir.join(format!("{domain}.key"));
    let new_entry = format!(
        r#"{{"host":"{domain}","cert":"{cert}","key":"{key}"}},"#,
        cert = cert_file.display(),
        key = key_file.display(),
    );

    let host_marker = format!(r#""host":"{domain}""#);
    let new_content = if content.contains(&host_marker) {
        content
            .lines()
            .map(|line| {
                if line.contains(&host_marker) {
                    new_entry.clone()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        let stripped = content.trim_start_matches(['[', '\n', ' ']);
        format!("[{new_entry}\n{stripped}")
    };

    fs::write(config_file, &new_content).context("failed to write feiniu nginx config")?;

    let verify = fs::read_to_string(config_file).unwrap_or_default();
    if !verify.contains(&cert_dir.display().to_string()) {
        anyhow::bail!("feiniu nginx config verification failed: certificate path missing");
    }

    info!(domain, "feiniu nginx config updated");
    Ok(())
}

async fn restart_services() {
    for service in FEINIU_SERVICES {
        match run_command("systemctl", &["restart", service]).await {
            Ok(_) => info!(service, "service restarted"),
            Err(err) => {
                warn!(?err, service, "restart failed, retrying with sudo");
                run_command_logged("sudo", &["systemctl", "restart", service]).await;
            }
        }
    }
}

fn is_permission_error(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
}

fn permission_hint(err: std::io::Error, feiniu_root: &Path) -> anyhow::Error {
    if is_permission_error(&err) {
        anyhow::anyhow!(
            "failed to create feiniu certificate directory: permission denied\n\
             fix permissions on the appliance with:\n  sudo chown -R $USER {}\n\
             original error: {err}",
            feiniu_root.display()
        )
    } else {
        anyhow::anyhow!("failed to create feiniu certificate directory: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nginx_config_prepends_new_host_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("network_gateway_cert.conf");
        fs::write(
            &config,
            "[{\"host\":\"other.example\",\"cert\":\"/old/c.crt\",\"key\":\"/old/k.key\"}]\n",
        )
        .expect("write");

        let cert_dir = dir.path().join("ssls/a.example/1700000000");
        update_nginx_config_at(&config, "a.example", &cert_dir).expect("update");

        let content = fs::read_to_string(&config).expect("read");
        assert!(content.starts_with("[{\"host\":\"a.example\""));
        assert!(content.contains("other.example"), "existing entry kept");
        assert!(content.contains(&cert_dir.display().to_string()));
    }

    #[test]
    fn nginx_config_replaces_matching_host_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("network_gateway_cert.conf");
        fs::write(
            &config,
            "[\n{\"host\":\"a.example\",\"cert\":\"/old/c.crt\",\"key\":\"/old/k.key\"},\n{\"host\":\"other.example\",\"cert\":\"/o/c.crt\",\"key\":\"/o/k.key\"}]\n",
        )
        .expect("write");

        let cert_dir = dir.path().join("ssls/a.example/1700000001");
        update_nginx_config_at(&config, "a.example", &cert_dir).expect("update");

        let content = fs::read_to_string(&config).expect("read");
        assert!(!content.contains("/old/c.crt"), "old entry replaced");
        assert!(content.contains(&cert_dir.display().to_string()));
        assert!(content.contains("other.example"));
    }

    #[test]
    fn nginx_config_backup_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("network_gateway_cert.conf");
        fs::write(&config, "[]").expect("write");

        let cert_dir = dir.path().join("ssls/a.example/1");
        // Verification fails (no entry contains the path in "[]"? it will,
        // because we prepend), so just assert the backup exists afterwards.
        let _ = update_nginx_config_at(&config, "a.example", &cert_dir);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn permission_hint_mentions_chown() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let hint = permission_hint(err, Path::new("/usr/trim/var/trim_connect/ssls"));
        assert!(hint.to_string().contains("sudo chown -R"), "{hint}");

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let plain = permission_hint(other, Path::new("/x"));
        assert!(!plain.to_string().contains("chown"));
    }
}
