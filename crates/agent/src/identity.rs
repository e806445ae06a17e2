//! Stable per-host client identity.
//!
//! The client id is `hex(SHA256(os|arch|hostname|hardwareToken))` where the
//! hardware token is the first stable platform source that yields a value.
//! The id is cached under the user config dir so later boots reuse it; a
//! corrupt cache is regenerated from the same inputs and comes out identical.

use std::fs;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use anssl_common::SystemInfo;

const CACHE_REL_PATH: &str = "anssl/client-id";

const PREFERRED_INTERFACES: &[&str] = &["en0", "eth0", "en1", "eth1", "wlan0", "wifi0"];

const VIRTUAL_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "virbr", "vmnet", "vboxnet", "tun", "tap", "ppp", "lo",
];

const DUMMY_UUIDS: &[&str] = &[
    "00000000-0000-0000-0000-000000000000",
    "ffffffff-ffff-ffff-ffff-ffffffffffff",
    "03000200-0400-0500-0006-000700080009",
    "00000000-0000-0000-0000-000000000001",
    "Not Available",
    "Not Specified",
    "System Product Name",
];

const PUBLIC_IP_SERVICES: &[&str] = &[
    "https://checkip.amazonaws.com",
    "https://ifconfig.me/ip",
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
];

/// Set to any non-empty value to skip the public-IP probe (air-gapped hosts
/// and tests); the local route address is used instead.
pub const DISABLE_PUBLIC_IP_ENV: &str = "ANSSL_DISABLE_PUBLIC_IP";

/// Host facts reported on registration. The IP prefers a public address and
/// falls back to the local route source address.
pub async fn collect_system_info() -> SystemInfo {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    let probe_disabled = std::env::var(DISABLE_PUBLIC_IP_ENV)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    let ip = if probe_disabled {
        local_ip().unwrap_or_default()
    } else {
        match public_ip().await {
            Some(ip) => ip,
            None => local_ip().unwrap_or_default(),
        }
    };

    SystemInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        hostname,
        ip,
    }
}

/// Resolve the stable client id, reading the cache first.
pub async fn client_id() -> String {
    if let Some(cached) = read_cached_id() {
        return cached;
    }

    let info = collect_system_info().await;
    let id = derive_client_id(&info, &hardware_token(&info));
    if let Err(err) = write_cached_id(&id) {
        warn!(?err, "failed to cache client id");
    }
    id
}

pub fn derive_client_id(info: &SystemInfo, hardware_token: &str) -> String {
    let combined = format!(
        "{}|{}|{}|{}",
        info.os, info.arch, info.hostname, hardware_token
    );
    let sum = Sha256::digest(combined.as_bytes());
    format!("{:x}", sum)
}

/// First non-empty hardware source, tagged with its origin so two sources
/// that happen to produce equal strings still hash differently.
fn hardware_token(info: &SystemInfo) -> String {
    #[cfg(target_os = "linux")]
    {
        linux_hardware_token(info)
    }
    #[cfg(target_os = "macos")]
    {
        mac_hardware_token(info)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        format!("sys:{}", system_based_id(info))
    }
}

#[cfg(target_os = "linux")]
fn linux_hardware_token(info: &SystemInfo) -> String {
    if let Some(id) = read_trimmed("/etc/machine-id") {
        return format!("mid:{id}");
    }
    if let Some(id) = read_trimmed("/var/lib/dbus/machine-id") {
        return format!("dbus:{id}");
    }
    if let Some(uuid) = read_trimmed("/sys/class/dmi/id/product_uuid").filter(|v| !is_dummy_uuid(v))
    {
        return format!("dmi:{uuid}");
    }
    if let Some(serial) =
        read_trimmed("/sys/class/dmi/id/board_serial").filter(|v| !is_dummy_uuid(v))
    {
        return format!("board:{serial}");
    }
    if let Some(mac) = first_stable_mac() {
        return format!("mac:{mac}");
    }
    format!("sys:{}", system_based_id(info))
}

#[cfg(target_os = "macos")]
fn mac_hardware_token(info: &SystemInfo) -> String {
    if let Some(uuid) = mac_profiler_value("platform_UUID").filter(|v| !is_dummy_uuid(v)) {
        return format!("hw:{uuid}");
    }
    if let Some(serial) = mac_profiler_value("serial_number") {
        return format!("serial:{serial}");
    }
    format!("sys:{}", system_based_id(info))
}

#[cfg(target_os = "macos")]
fn mac_profiler_value(key: &str) -> Option<String> {
    let output = std::process::Command::new("system_profiler")
        .args(["SPHardwareDataType", "-json"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    let items = parsed.get("SPHardwareDataType")?.as_array()?;
    let value = items.first()?.get(key)?.as_str()?.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Walk `/sys/class/net` for the first up, non-virtual interface with a real
/// MAC, trying the well-known names first.
#[cfg(target_os = "linux")]
fn first_stable_mac() -> Option<String> {
    let entries: Vec<String> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();

    for preferred in PREFERRED_INTERFACES {
        if entries.iter().any(|name| name == preferred) {
            if let Some(mac) = interface_mac(preferred) {
                return Some(mac);
            }
        }
    }

    for name in &entries {
        if is_virtual_interface(name) {
            continue;
        }
        if let Some(mac) = interface_mac(name) {
            return Some(mac);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn interface_mac(name: &str) -> Option<String> {
    let state = read_trimmed(format!("/sys/class/net/{name}/operstate"))?;
    if state != "up" {
        return None;
    }
    let mac = read_trimmed(format!("/sys/class/net/{name}/address"))?;
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}

fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn is_dummy_uuid(value: &str) -> bool {
    let trimmed = value.trim();
    DUMMY_UUIDS
        .iter()
        .any(|dummy| trimmed.eq_ignore_ascii_case(dummy))
}

/// Fallback token when no hardware source is usable: a short hash over the
/// system facts themselves.
fn system_based_id(info: &SystemInfo) -> String {
    let combined = format!("{}|{}|{}|{}", info.os, info.arch, info.hostname, info.ip);
    let sum = Sha256::digest(combined.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &sum[..8] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn read_trimmed(path: impl AsRef<std::path::Path>) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim().to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn cache_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join(CACHE_REL_PATH))
}

fn read_cached_id() -> Option<String> {
    let path = cache_path()?;
    let raw = fs::read_to_string(path).ok()?;
    let id = raw.trim();
    if is_valid_client_id(id) {
        Some(id.to_string())
    } else {
        warn!("cached client id is corrupt, regenerating");
        None
    }
}

fn write_cached_id(id: &str) -> anyhow::Result<()> {
    let path = cache_path().ok_or_else(|| anyhow::anyhow!("no user config directory"))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{id}\n"))?;
    Ok(())
}

/// A client id is the hex form of a SHA-256 digest: 64 lowercase hex chars.
pub fn is_valid_client_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .ok()?;

    for service in PUBLIC_IP_SERVICES {
        if let Some(ip) = ip_from_service(&client, service).await {
            return Some(ip);
        }
    }
    None
}

async fn ip_from_service(client: &reqwest::Client, url: &str) -> Option<String> {
    let resp = client
        .get(url)
        .header(reqwest::header::USER_AGENT, "anssl-agent/1.0")
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body = resp.text().await.ok()?;
    let ip = body.trim().to_string();
    ip.parse::<std::net::IpAddr>().ok()?;
    Some(ip)
}

/// Source address of the default route, without sending any packet.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
