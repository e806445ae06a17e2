//! Tencent Cloud SSL: TC3-HMAC-SHA256 signed JSON API.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{CloudProvider, ProviderError, PROVIDER_TIMEOUT};

const DEFAULT_HOST: &str = "ssl.tencentcloudapi.com";
const SERVICE: &str = "ssl";
const VERSION: &str = "2019-12-05";
const REGION: &str = "ap-guangzhou";
const ALGORITHM: &str = "TC3-HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

pub struct TencentProvider {
    secret_id: String,
    secret_key: String,
    endpoint: String,
    host: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiEnvelope {
    response: ApiResponse,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ApiResponse {
    error: Option<ApiError>,
    request_id: String,
    certificate_id: String,
    repeat_cert_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ApiError {
    code: String,
    message: String,
}

impl TencentProvider {
    pub fn new(secret_id: String, secret_key: String) -> Self {
        Self::with_endpoint(
            secret_id,
            secret_key,
            format!("https://{DEFAULT_HOST}"),
            DEFAULT_HOST.to_string(),
        )
    }

    pub fn with_endpoint(
        secret_id: String,
        secret_key: String,
        endpoint: String,
        host: String,
    ) -> Self {
        Self {
            secret_id,
            secret_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host,
            http: reqwest::Client::new(),
        }
    }

    async fn call(&self, action: &str, payload: serde_json::Value) -> Result<ApiResponse, ProviderError> {
        let body = payload.to_string();
        let timestamp = Utc::now().timestamp();
        let authorization = self.sign(action, &body, timestamp);

        let resp = self
            .http
            .post(&self.endpoint)
            .timeout(PROVIDER_TIMEOUT)
            .header("Authorization", authorization)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Host", &self.host)
            .header("X-TC-Action", action)
            .header("X-TC-Version", VERSION)
            .header("X-TC-Region", REGION)
            .header("X-TC-Timestamp", timestamp.to_string())
            .body(body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                action: action.into(),
                source: err.into(),
            })?;

        let text = resp.text().await.map_err(|err| ProviderError::Transport {
            action: action.into(),
            source: err.into(),
        })?;

        let envelope: ApiEnvelope =
            serde_json::from_str(&text).map_err(|_| ProviderError::BadResponse {
                action: action.into(),
                message: format!("unexpected response body: {text}"),
            })?;

        if let Some(error) = envelope.response.error {
            return Err(ProviderError::Api {
                action: action.into(),
                code: error.code,
                request_id: envelope.response.request_id,
                message: error.message,
            });
        }

        Ok(envelope.response)
    }

    /// TC3-HMAC-SHA256 Authorization header for one request.
    fn sign(&self, action: &str, body: &str, timestamp: i64) -> String {
        let date = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();

        let canonical_headers = format!(
            "content-type:application/json; charset=utf-8\nhost:{}\nx-tc-action:{}\n",
            self.host,
            action.to_lowercase()
        );
        let signed_headers = "content-type;host;x-tc-action";
        let hashed_payload = sha256_hex(body.as_bytes());
        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{hashed_payload}"
        );

        let credential_scope = format!("{date}/{SERVICE}/tc3_request");
        let string_to_sign = format!(
            "{ALGORITHM}\n{timestamp}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret_date = hmac_sha256(
            format!("TC3{}", self.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let secret_service = hmac_sha256(&secret_date, SERVICE.as_bytes());
        let secret_signing = hmac_sha256(&secret_service, b"tc3_request");
        let signature = hex_encode(&hmac_sha256(&secret_signing, string_to_sign.as_bytes()));

        format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.secret_id
        )
    }
}

#[async_trait]
impl CloudProvider for TencentProvider {
    async fn test_connection(&self) -> Result<bool, ProviderError> {
        self.call(
            "DescribeCertificates",
            json!({ "Offset": 0, "Limit": 1 }),
        )
        .await?;
        Ok(true)
    }

    async fn upload_certificate(
        &self,
        name: &str,
        _domain: &str,
        cert: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        let mut payload = json!({
            "CertificatePublicKey": cert,
            "CertificatePrivateKey": key,
            "CertificateType": "SVR",
            "Repeatable": true,
        });
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            payload["Alias"] = json!(trimmed);
        }

        let response = self.call("UploadCertificate", payload).await?;

        if response.certificate_id.trim().is_empty() && response.repeat_cert_id.trim().is_empty() {
            return Err(ProviderError::BadResponse {
                action: "UploadCertificate".into(),
                message: format!(
                    "upload response missing certificate id (requestId={})",
                    response.request_id
                ),
            });
        }
        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
