//! RustFS target: the object store expects fixed file names under its TLS
//! directory, cert world-readable and key owner-only.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use super::{copy_file_with_mode, CERT_FILE, KEY_FILE};

pub(super) fn install(source: &Path, rustfs_root: &Path, safe_domain: &str) -> anyhow::Result<()> {
    let target = rustfs_root.join(safe_domain);

    if target.exists() {
        fs::remove_dir_all(&target).context("failed to remove existing rustfs cert directory")?;
    }
    fs::create_dir_all(&target).context("failed to create rustfs cert directory")?;

    copy_file_with_mode(
        &source.join(CERT_FILE),
        &target.join("rustfs_cert.pem"),
        0o644,
    )
    .context("failed to copy certificate")?;
    copy_file_with_mode(
        &source.join(KEY_FILE),
        &target.join("rustfs_key.pem"),
        0o600,
    )
    .context("failed to copy private key")?;

    info!(path = %target.display(), "certificates installed for rustfs");
    Ok(())
}
