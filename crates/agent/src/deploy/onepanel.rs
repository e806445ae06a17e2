//! 1Panel target: paste-upload the PEM pair through the panel API. The
//! token scheme is the panel's own: `md5("1panel" + apiKey + timestamp)`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::OnePanelConfig;

use super::{CERT_FILE, KEY_FILE};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PanelResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub(super) async fn upload(
    http: &reqwest::Client,
    panel: &OnePanelConfig,
    source: &Path,
    domain: &str,
) -> anyhow::Result<()> {
    if panel.url.is_empty() {
        anyhow::bail!("1panel api url not configured (ssl.onePanel.url)");
    }
    if panel.api_key.is_empty() {
        anyhow::bail!("1panel api key not configured (ssl.onePanel.apiKey)");
    }

    let certificate = fs::read_to_string(source.join(CERT_FILE))
        .context("failed to read certificate file")?;
    let private_key =
        fs::read_to_string(source.join(KEY_FILE)).context("failed to read private key file")?;

    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    let token = panel_token(&panel.api_key, &timestamp);
    let url = format!(
        "{}/api/v2/websites/ssl/upload",
        panel.url.trim_end_matches('/')
    );

    let resp = http
        .post(url)
        .timeout(UPLOAD_TIMEOUT)
        .header("1Panel-Token", token)
        .header("1Panel-Timestamp", timestamp)
        .json(&json!({
            "type": "paste",
            "certificate": certificate,
            "privateKey": private_key,
            "description": "deployed by anssl",
        }))
        .send()
        .await
        .context("1panel upload request failed")?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("1panel api returned status {status}: {body}");
    }

    let parsed: PanelResponse =
        serde_json::from_str(&body).with_context(|| format!("invalid 1panel response: {body}"))?;
    if parsed.code != 200 {
        anyhow::bail!("1panel api error: {} (code {})", parsed.message, parsed.code);
    }

    info!(domain, "certificate uploaded to 1panel");
    Ok(())
}

fn panel_token(api_key: &str, timestamp: &str) -> String {
    let digest = Md5::digest(format!("1panel{api_key}{timestamp}").as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn scratch_with_bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CERT_FILE), "CERT PEM").expect("write cert");
        fs::write(dir.path().join(KEY_FILE), "KEY PEM").expect("write key");
        dir
    }

    fn panel(url: String) -> OnePanelConfig {
        OnePanelConfig {
            url,
            api_key: "panel-key".into(),
        }
    }

    #[test]
    fn token_is_md5_over_fixed_prefix_key_and_timestamp() {
        // md5("1panel" + "abc" + "1700000000000")
        let token = panel_token("abc", "1700000000000");
        assert_eq!(token.len(), 32);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        // Deterministic for equal inputs, different otherwise.
        assert_eq!(token, panel_token("abc", "1700000000000"));
        assert_ne!(token, panel_token("abd", "1700000000000"));
        assert_ne!(token, panel_token("abc", "1700000000001"));
    }

    #[tokio::test]
    async fn upload_posts_paste_payload_with_auth_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v2/websites/ssl/upload")
                    .header_exists("1Panel-Token")
                    .header_exists("1Panel-Timestamp")
                    .json_body_partial(
                        r#"{"type":"paste","certificate":"CERT PEM","privateKey":"KEY PEM"}"#,
                    );
                then.status(200).json_body(json!({"code": 200, "message": "ok"}));
            })
            .await;

        let scratch = scratch_with_bundle();
        let http = reqwest::Client::new();
        upload(&http, &panel(server.url("")), scratch.path(), "a.example")
            .await
            .expect("upload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_200_body_code_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/websites/ssl/upload");
                then.status(200)
                    .json_body(json!({"code": 500, "message": "bad certificate"}));
            })
            .await;

        let scratch = scratch_with_bundle();
        let http = reqwest::Client::new();
        let err = upload(&http, &panel(server.url("")), scratch.path(), "a.example")
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("bad certificate"), "{err}");
    }

    #[tokio::test]
    async fn http_error_status_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v2/websites/ssl/upload");
                then.status(401).body("unauthorized");
            })
            .await;

        let scratch = scratch_with_bundle();
        let http = reqwest::Client::new();
        let err = upload(&http, &panel(server.url("")), scratch.path(), "a.example")
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected_before_any_request() {
        let scratch = scratch_with_bundle();
        let http = reqwest::Client::new();
        let config = OnePanelConfig {
            url: "http://panel.local".into(),
            api_key: String::new(),
        };
        let err = upload(&http, &config, scratch.path(), "a.example")
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("apiKey"), "{err}");
    }
}
