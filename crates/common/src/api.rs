//! Wire-format DTOs for the control stream.
//!
//! The canonical schema is protobuf; on the wire the agent speaks the
//! protojson rendering of it: camelCase field names, enum values as
//! SCREAMING_SNAKE strings, unset fields omitted, unknown fields ignored.
//! Every worker→server frame is a [`NotifyRequest`]; every server→worker
//! frame is a [`NotifyResponse`] demultiplexed on its `type` field.

use serde::{Deserialize, Serialize};

/// Message kinds the central service pushes to the agent.
///
/// `Unknown` doubles as the tombstone value and the catch-all for types
/// introduced by newer servers; handlers ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "CONNECT")]
    Connect,
    #[serde(rename = "CHALLENGE")]
    Challenge,
    #[serde(rename = "EXECUTE_BUSINESS")]
    ExecuteBusiness,
    #[serde(rename = "UPDATE_VERSION")]
    UpdateVersion,
    #[serde(rename = "GET_PROVIDER")]
    GetProvider,
    #[default]
    #[serde(rename = "UNKNOWN", other)]
    Unknown,
}

/// Sub-action selector for EXECUTE_BUSINESS messages. The string values are
/// a stable contract with the server; never renumber or rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecuteBusinessType {
    #[default]
    #[serde(rename = "UPLOAD_CERT")]
    UploadCert,
    #[serde(rename = "ANSSL_CLI_CERT")]
    AnsslCliCert,
    #[serde(rename = "ANSSL_CLI_APACHE_CERT")]
    AnsslCliApacheCert,
    #[serde(rename = "ANSSL_CLI_RUSTFS_CERT")]
    AnsslCliRustfsCert,
    #[serde(rename = "ANSSL_CLI_1PANEL_CERT")]
    AnsslCli1PanelCert,
    #[serde(rename = "ANSSL_CLI_FEINIU_CERT")]
    AnsslCliFeiniuCert,
    /// Forward-compatibility catch-all; replied to with NOT_SUPPORTED.
    #[serde(other)]
    Unsupported,
}

/// Outcome reported back for a request-bearing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestResult {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "NOT_SUPPORTED")]
    NotSupported,
}

/// Host facts sent with the registration frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub ip: String,
}

/// CONNECT request payload: which configured provider to test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectRequest {
    pub provider: String,
    /// Set only in the agent's reply.
    #[serde(skip_serializing_if = "is_false")]
    pub success: bool,
}

/// EXECUTE_BUSINESS / CHALLENGE payload pushed by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteBusinessResponse {
    pub provider: String,
    pub execute_business_type: ExecuteBusinessType,
    pub domain: String,
    pub url: String,
    pub cert: String,
    pub key: String,
    pub challenge_token: String,
    pub challenge_response: String,
}

/// Agent's reply payload for EXECUTE_BUSINESS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBusinessRequest {
    pub request_result: RequestResult,
}

/// One configured provider, as enumerated for GET_PROVIDER.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderInfo {
    pub name: String,
    pub remark: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetProviderResponse {
    pub providers: Vec<ProviderInfo>,
}

/// Registration payload (first frame after the stream opens).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    pub system_info: SystemInfo,
}

/// Server→worker envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyResponse {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_request: Option<ConnectRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_business_response: Option<ExecuteBusinessResponse>,
}

/// Worker→server envelope. Exactly one payload field is set per frame; a
/// frame with none is a heartbeat carrying only identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyRequest {
    pub access_key: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_response: Option<RegisterResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_request: Option<ConnectRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_business_request: Option<ExecuteBusinessRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_provider_response: Option<GetProviderResponse>,
}

/// Stable identity fields attached to every outbound frame.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub access_key: String,
    pub client_id: String,
    pub version: String,
}

impl NotifyRequest {
    fn base(identity: &AgentIdentity) -> Self {
        Self {
            access_key: identity.access_key.clone(),
            client_id: identity.client_id.clone(),
            version: identity.version.clone(),
            ..Self::default()
        }
    }

    /// Registration frame carrying the host facts.
    pub fn register(identity: &AgentIdentity, system_info: SystemInfo) -> Self {
        Self {
            register_response: Some(RegisterResponse { system_info }),
            ..Self::base(identity)
        }
    }

    /// Identity-only liveness frame.
    pub fn heartbeat(identity: &AgentIdentity) -> Self {
        Self::base(identity)
    }

    /// Reply to a CONNECT provider test.
    pub fn connect_reply(
        identity: &AgentIdentity,
        request_id: &str,
        provider: &str,
        success: bool,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            connect_request: Some(ConnectRequest {
                provider: provider.to_string(),
                success,
            }),
            ..Self::base(identity)
        }
    }

    /// Reply to an EXECUTE_BUSINESS message.
    pub fn execute_reply(
        identity: &AgentIdentity,
        request_id: &str,
        result: RequestResult,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            execute_business_request: Some(ExecuteBusinessRequest {
                request_result: result,
            }),
            ..Self::base(identity)
        }
    }

    /// Reply to GET_PROVIDER with the configured provider list.
    pub fn provider_reply(
        identity: &AgentIdentity,
        request_id: &str,
        providers: Vec<ProviderInfo>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            get_provider_response: Some(GetProviderResponse { providers }),
            ..Self::base(identity)
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}
