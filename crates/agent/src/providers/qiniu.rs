//! Qiniu cloud: QBox-signed REST against the certificate API.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha1::Sha1;

use super::{CloudProvider, ProviderError, PROVIDER_TIMEOUT};

const DEFAULT_BASE_URL: &str = "https://api.qiniu.com";

pub struct QiniuProvider {
    access_key: String,
    secret_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl QiniuProvider {
    pub fn new(access_key: String, secret_key: String) -> Self {
        Self::with_base_url(access_key, secret_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(access_key: String, secret_key: String, base_url: String) -> Self {
        Self {
            access_key,
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// QBox management token: `ak:base64url(hmac_sha1(sk, path + "\n"))`.
    /// The body is only part of the signature for form-encoded requests,
    /// which the certificate API does not use.
    fn qbox_token(&self, path_with_query: &str) -> String {
        let data = format!("{path_with_query}\n");
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        let signature = URL_SAFE.encode(mac.finalize().into_bytes());
        format!("{}:{}", self.access_key, signature)
    }

    fn authorization(&self, path: &str) -> String {
        format!("QBox {}", self.qbox_token(path))
    }
}

#[async_trait]
impl CloudProvider for QiniuProvider {
    async fn test_connection(&self) -> Result<bool, ProviderError> {
        let action = "GET /sslcert";
        let resp = self
            .http
            .get(format!("{}/sslcert", self.base_url))
            .timeout(PROVIDER_TIMEOUT)
            .header("Authorization", self.authorization("/sslcert"))
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                action: action.into(),
                source: err.into(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                action: action.into(),
                code: status.as_u16().to_string(),
                request_id: String::new(),
                message: body,
            });
        }
        Ok(true)
    }

    async fn upload_certificate(
        &self,
        name: &str,
        _domain: &str,
        cert: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        let action = "POST /sslcert";
        let resp = self
            .http
            .post(format!("{}/sslcert", self.base_url))
            .timeout(PROVIDER_TIMEOUT)
            .header("Authorization", self.authorization("/sslcert"))
            .json(&json!({
                "Name": name,
                "Ca": cert,
                "Pri": key,
            }))
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                action: action.into(),
                source: err.into(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                action: action.into(),
                code: status.as_u16().to_string(),
                request_id: String::new(),
                message: body,
            });
        }
        Ok(())
    }
}
