//! Archive handling: checksum verification and single-binary extraction.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::read::GzDecoder;
use sha2::Digest;

pub fn sha256_hex(path: &Path) -> anyhow::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Find the checksum line matching `asset_name` in a `checksums.txt` body
/// (`<hex>  <filename>` per line).
pub fn checksum_for(checksums: &str, asset_name: &str) -> Option<String> {
    for line in checksums.lines() {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        if let Some(name) = parts.next() {
            if name == asset_name {
                return Some(hash.to_string());
            }
        }
    }
    None
}

pub fn verify_sha256(archive: &Path, checksums_path: &Path, asset_name: &str) -> anyhow::Result<()> {
    let raw = fs::read_to_string(checksums_path).with_context(|| {
        format!("failed to read checksum file {}", checksums_path.display())
    })?;
    let expected = checksum_for(&raw, asset_name)
        .ok_or_else(|| anyhow::anyhow!("no checksum entry for {asset_name}"))?;
    let actual = sha256_hex(archive)
        .with_context(|| format!("failed to hash {}", archive.display()))?;

    if expected != actual {
        anyhow::bail!(
            "checksum mismatch for {asset_name}: expected {expected}, got {actual}"
        );
    }
    Ok(())
}

/// Extract the single regular file out of the downloaded archive. Supports
/// `.tar.gz` and `.zip`; any other name is assumed to be the raw binary.
pub fn extract_binary(archive_path: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") {
        return extract_from_tar_gz(archive_path, out_dir);
    }
    if name.ends_with(".zip") {
        return extract_from_zip(archive_path, out_dir);
    }
    Ok(archive_path.to_path_buf())
}

fn extract_from_tar_gz(archive_path: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let file = fs::File::open(archive_path)?;
    let gz = GzDecoder::new(file);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if file_name.is_empty() {
            continue;
        }

        let dest = out_dir.join(&file_name);
        entry.unpack(&dest)?;
        return Ok(dest);
    }

    anyhow::bail!(
        "archive {} contained no regular file entry",
        archive_path.display()
    )
}

fn extract_from_zip(archive_path: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let file_name = Path::new(entry.name())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if file_name.is_empty() {
            continue;
        }

        let dest = out_dir.join(&file_name);
        let mut out = fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        return Ok(dest);
    }

    anyhow::bail!(
        "archive {} contained no file entry",
        archive_path.display()
    )
}
