//! Adapters to third-party certificate services.
//!
//! Every provider exposes the same two capabilities: a credential check and
//! a certificate upload. Which adapter backs a configured name is decided
//! here; the rest of the agent only sees the registry.

mod aliyun;
mod qiniu;
mod tencent;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::ProviderConfig;

pub(crate) const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Error surfaced by a provider API call, keeping the remote action, error
/// code and request id when the service reports them.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider api error (action={action}, code={code}, requestId={request_id}): {message}")]
    Api {
        action: String,
        code: String,
        request_id: String,
        message: String,
    },
    #[error("provider request failed (action={action}): {source}")]
    Transport {
        action: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("provider response invalid (action={action}): {message}")]
    BadResponse { action: String, message: String },
    #[error("provider configuration incomplete: {0}")]
    Config(String),
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Cheap call that only proves the credentials work.
    async fn test_connection(&self) -> Result<bool, ProviderError>;

    /// Upload a PEM pair under `name`; `domain` is informational for
    /// providers that want it.
    async fn upload_certificate(
        &self,
        name: &str,
        domain: &str,
        cert: &str,
        key: &str,
    ) -> Result<(), ProviderError>;
}

/// Configured provider adapters, keyed by the config entry name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    handlers: HashMap<String, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(entries: &[ProviderConfig]) -> Self {
        let mut handlers: HashMap<String, Arc<dyn CloudProvider>> = HashMap::new();

        for entry in entries {
            match build_provider(entry) {
                Ok(handler) => {
                    handlers.insert(entry.name.clone(), handler);
                }
                Err(err) => {
                    warn!(?err, provider = %entry.name, "skipping misconfigured provider");
                }
            }
        }

        Self { handlers }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub async fn test_connection(&self, name: &str) -> anyhow::Result<bool> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("provider not configured: {name}"))?;
        Ok(handler.test_connection().await?)
    }

    pub async fn upload_certificate(
        &self,
        name: &str,
        remark: &str,
        domain: &str,
        cert: &str,
        key: &str,
    ) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("provider not configured: {name}"))?;
        handler
            .upload_certificate(remark, domain, cert, key)
            .await?;
        Ok(())
    }
}

fn build_provider(entry: &ProviderConfig) -> Result<Arc<dyn CloudProvider>, ProviderError> {
    match entry.name.as_str() {
        "aliyun" => {
            if entry.access_key_id.is_empty() || entry.access_key_secret.is_empty() {
                return Err(ProviderError::Config(
                    "aliyun requires accessKeyId and accessKeySecret".into(),
                ));
            }
            Ok(Arc::new(aliyun::AliyunProvider::new(
                entry.access_key_id.clone(),
                entry.access_key_secret.clone(),
                entry.esa_site_id.clone(),
            )))
        }
        "qiniu" => {
            if entry.access_key.is_empty() || entry.access_secret.is_empty() {
                return Err(ProviderError::Config(
                    "qiniu requires accessKey and accessSecret".into(),
                ));
            }
            Ok(Arc::new(qiniu::QiniuProvider::new(
                entry.access_key.clone(),
                entry.access_secret.clone(),
            )))
        }
        "cloudTencent" => {
            if entry.secret_id.is_empty() || entry.secret_key.is_empty() {
                return Err(ProviderError::Config(
                    "cloudTencent requires secretId and secretKey".into(),
                ));
            }
            Ok(Arc::new(tencent::TencentProvider::new(
                entry.secret_id.clone(),
                entry.secret_key.clone(),
            )))
        }
        other => Err(ProviderError::Config(format!(
            "unsupported provider: {other}"
        ))),
    }
}
