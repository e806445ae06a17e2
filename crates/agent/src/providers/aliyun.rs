//! Aliyun certificate services, covering both the classic certificate
//! store (CAS) and the edge acceleration platform (ESA).
//!
//! Calls are RPC-style signed requests (HMAC-SHA1 over the sorted query).
//! ESA rejects duplicate certificate names, so the upload path carries a
//! recovery ladder: update by resolved id, match by fingerprint, and as a
//! last resort retry under a unique generated name.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Timelike, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{CloudProvider, ProviderError, PROVIDER_TIMEOUT};

const CAS_ENDPOINT: &str = "https://cas.aliyuncs.com";
const CAS_VERSION: &str = "2020-04-07";
const ESA_ENDPOINT: &str = "https://esa.cn-hangzhou.aliyuncs.com";
const ESA_VERSION: &str = "2024-09-10";

const DUPLICATED_CODE: &str = "Certificate.Duplicated";
const LIST_PAGE_SIZE: u32 = 50;
const LIST_MAX_PAGES: u32 = 20;

/// RFC 3986 unreserved set, which is what the aliyun signature expects.
const SIGN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct AliyunProvider {
    access_key_id: String,
    access_key_secret: String,
    /// Non-empty selects ESA mode; empty means CAS.
    esa_site_id: String,
    cas_endpoint: String,
    esa_endpoint: String,
    http: reqwest::Client,
}

impl AliyunProvider {
    pub fn new(access_key_id: String, access_key_secret: String, esa_site_id: String) -> Self {
        Self {
            access_key_id,
            access_key_secret,
            esa_site_id: esa_site_id.trim().to_string(),
            cas_endpoint: CAS_ENDPOINT.to_string(),
            esa_endpoint: ESA_ENDPOINT.to_string(),
            http: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    fn with_endpoints(mut self, cas: String, esa: String) -> Self {
        self.cas_endpoint = cas;
        self.esa_endpoint = esa;
        self
    }

    fn is_esa(&self) -> bool {
        !self.esa_site_id.is_empty()
    }

    async fn rpc_call(
        &self,
        endpoint: &str,
        version: &str,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ProviderError> {
        let mut all: Vec<(String, String)> = vec![
            ("Action".into(), action.into()),
            ("Version".into(), version.into()),
            ("Format".into(), "JSON".into()),
            ("AccessKeyId".into(), self.access_key_id.clone()),
            ("SignatureMethod".into(), "HMAC-SHA1".into()),
            ("SignatureVersion".into(), "1.0".into()),
            ("SignatureNonce".into(), next_nonce()),
            (
                "Timestamp".into(),
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ];
        for (key, value) in params {
            all.push(((*key).into(), (*value).into()));
        }

        let signature = rpc_signature(&self.access_key_secret, "GET", &all);
        all.push(("Signature".into(), signature));

        let query: Vec<String> = all
            .iter()
            .map(|(k, v)| format!("{}={}", sign_encode(k), sign_encode(v)))
            .collect();
        let url = format!("{}/?{}", endpoint.trim_end_matches('/'), query.join("&"));

        let resp = self
            .http
            .get(url)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                action: action.into(),
                source: err.into(),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|err| ProviderError::Transport {
            action: action.into(),
            source: err.into(),
        })?;

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let code = get_ci(&body, &["Code"])
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if !status.is_success() || (!code.is_empty() && !code.eq_ignore_ascii_case("Success")) {
            let message = get_ci(&body, &["Message"])
                .and_then(|v| v.as_str())
                .unwrap_or(&text)
                .to_string();
            let request_id = get_ci(&body, &["RequestId"])
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Err(ProviderError::Api {
                action: action.into(),
                code: if code.is_empty() {
                    status.as_u16().to_string()
                } else {
                    code
                },
                request_id,
                message,
            });
        }

        Ok(body)
    }

    async fn esa_set_certificate(
        &self,
        name: &str,
        cert: &str,
        key: &str,
        id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("SiteId", self.esa_site_id.as_str()),
            ("Type", "upload"),
            ("Name", name),
            ("Certificate", cert),
            ("PrivateKey", key),
        ];
        if let Some(id) = id {
            params.push(("Id", id));
        }

        self.rpc_call(&self.esa_endpoint, ESA_VERSION, "SetCertificate", &params)
            .await?;
        Ok(())
    }

    async fn esa_list_certificates(&self) -> Result<Vec<Value>, ProviderError> {
        let mut records = Vec::new();

        for page in 1..=LIST_MAX_PAGES {
            let page_number = page.to_string();
            let page_size = LIST_PAGE_SIZE.to_string();
            let body = self
                .rpc_call(
                    &self.esa_endpoint,
                    ESA_VERSION,
                    "ListCertificates",
                    &[
                        ("SiteId", self.esa_site_id.as_str()),
                        ("PageNumber", page_number.as_str()),
                        ("PageSize", page_size.as_str()),
                    ],
                )
                .await?;

            let batch = find_certificate_records(&body).unwrap_or_default();
            let batch_len = batch.len();
            records.extend(batch);

            let total = get_ci(&body, &["TotalCount"])
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            if batch_len < LIST_PAGE_SIZE as usize || (total > 0 && records.len() >= total) {
                break;
            }
        }

        Ok(records)
    }

    /// Duplicate-name recovery: update by id resolved from the exact name,
    /// else by the uploaded certificate's fingerprint, else retry fresh
    /// under a unique generated name.
    async fn esa_recover_duplicate(
        &self,
        name: &str,
        domain: &str,
        cert: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        let records = self.esa_list_certificates().await?;

        match select_certificate_id_by_name(&records, name) {
            Ok(id) => {
                warn!(name, %id, "duplicate certificate name, updating by id");
                return self.esa_set_certificate(name, cert, key, Some(&id)).await;
            }
            Err(err) => warn!(%err, name, "could not resolve duplicate by name"),
        }

        match extract_cert_fingerprint(cert) {
            Ok(fingerprint) => match select_certificate_id_by_fingerprint(&records, &fingerprint) {
                Ok(id) => {
                    warn!(%id, "duplicate resolved by certificate fingerprint");
                    return self.esa_set_certificate(name, cert, key, Some(&id)).await;
                }
                Err(err) => warn!(%err, "could not resolve duplicate by fingerprint"),
            },
            Err(err) => warn!(%err, "could not fingerprint uploaded certificate"),
        }

        let fallback = build_unique_certificate_name(name, domain, Utc::now());
        warn!(%fallback, "uploading duplicate certificate under a fresh name");
        self.esa_set_certificate(&fallback, cert, key, None).await
    }
}

#[async_trait]
impl CloudProvider for AliyunProvider {
    async fn test_connection(&self) -> Result<bool, ProviderError> {
        if self.is_esa() {
            let page = "1";
            self.rpc_call(
                &self.esa_endpoint,
                ESA_VERSION,
                "ListCertificates",
                &[
                    ("SiteId", self.esa_site_id.as_str()),
                    ("PageNumber", page),
                    ("PageSize", page),
                ],
            )
            .await?;
        } else {
            self.rpc_call(&self.cas_endpoint, CAS_VERSION, "ListCsr", &[])
                .await?;
        }
        Ok(true)
    }

    async fn upload_certificate(
        &self,
        name: &str,
        domain: &str,
        cert: &str,
        key: &str,
    ) -> Result<(), ProviderError> {
        if !self.is_esa() {
            self.rpc_call(
                &self.cas_endpoint,
                CAS_VERSION,
                "UploadUserCertificate",
                &[("Name", name), ("Cert", cert), ("Key", key)],
            )
            .await?;
            return Ok(());
        }

        match self.esa_set_certificate(name, cert, key, None).await {
            Ok(()) => Ok(()),
            Err(err) if is_duplicated_error(&err) => {
                self.esa_recover_duplicate(name, domain, cert, key).await
            }
            Err(err) => Err(err),
        }
    }
}

fn next_nonce() -> String {
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        counter
    )
}

fn sign_encode(value: &str) -> String {
    utf8_percent_encode(value, SIGN_ENCODE_SET).to_string()
}

/// RPC signature: base64(HMAC-SHA1(secret + "&", method&%2F&encodedQuery))
/// over the params sorted by key.
fn rpc_signature(secret: &str, method: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", sign_encode(k), sign_encode(v)))
        .collect();
    let string_to_sign = format!(
        "{}&{}&{}",
        method,
        sign_encode("/"),
        sign_encode(&canonical.join("&"))
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{secret}&").as_bytes())
        .expect("hmac accepts any key length");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn is_duplicated_error(err: &ProviderError) -> bool {
    match err {
        ProviderError::Api { code, message, .. } => {
            code == DUPLICATED_CODE || message.contains(DUPLICATED_CODE)
        }
        _ => false,
    }
}

/// Case-insensitive lookup across candidate keys.
fn get_ci<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let object = value.as_object()?;
    for key in keys {
        if let Some((_, found)) = object
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
        {
            return Some(found);
        }
    }
    None
}

fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Locate the certificate record array in a ListCertificates response; the
/// API has shipped it under a few different wrapper keys.
fn find_certificate_records(body: &Value) -> Option<Vec<Value>> {
    const PREFERRED_KEYS: &[&str] = &[
        "Result",
        "Certificates",
        "CertificateList",
        "CertList",
        "Items",
        "List",
        "Data",
        "body",
    ];

    match body {
        Value::Array(items) => {
            if is_certificate_record_array(items) {
                Some(items.clone())
            } else {
                items.iter().find_map(find_certificate_records)
            }
        }
        Value::Object(_) => {
            for key in PREFERRED_KEYS {
                if let Some(next) = get_ci(body, &[key]) {
                    if let Some(found) = find_certificate_records(next) {
                        return Some(found);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn is_certificate_record_array(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| get_ci(item, &["Id", "CertId", "CertificateId"]).is_some())
}

/// Exact-name match. A single non-`free` record wins; zero, several, or a
/// `free`-type record is an error and the ladder moves on.
fn select_certificate_id_by_name(records: &[Value], name: &str) -> Result<String, ProviderError> {
    let wanted = name.trim();
    let mut matches = Vec::new();

    for record in records {
        let cert_name = value_to_string(get_ci(record, &["Name", "CertName", "CertificateName"]));
        if !cert_name.eq_ignore_ascii_case(wanted) {
            continue;
        }

        let id = value_to_string(get_ci(record, &["Id", "CertId", "CertificateId"]));
        if id.is_empty() {
            return Err(bad_list(format!("certificate record missing id: name={cert_name}")));
        }

        let cert_type =
            value_to_string(get_ci(record, &["Type", "CertType", "CertificateType"])).to_lowercase();
        if cert_type == "free" {
            return Err(bad_list(
                "certificate with the same name is a free certificate and cannot be updated by id"
                    .to_string(),
            ));
        }

        matches.push(id);
    }

    match matches.len() {
        0 => Err(bad_list(format!("no certificate matches name {wanted}"))),
        1 => Ok(matches.remove(0)),
        count => Err(bad_list(format!(
            "{count} certificates match name {wanted}, refusing to pick one"
        ))),
    }
}

fn select_certificate_id_by_fingerprint(
    records: &[Value],
    fingerprint: &str,
) -> Result<String, ProviderError> {
    let wanted = normalize_comparable_token(fingerprint);
    let mut matches = Vec::new();

    for record in records {
        let id = value_to_string(get_ci(record, &["Id", "CertId", "CertificateId"]));
        if id.is_empty() {
            continue;
        }

        let candidate = normalize_comparable_token(&value_to_string(get_ci(
            record,
            &["FingerprintSha256", "Fingerprint", "CertFingerprint"],
        )));
        if !wanted.is_empty() && wanted != "0" && candidate == wanted {
            matches.push(id);
        }
    }

    match matches.len() {
        0 => Err(bad_list("no certificate matches the uploaded fingerprint".to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(bad_list(format!(
            "{count} certificates match the uploaded fingerprint, refusing to pick one"
        ))),
    }
}

fn bad_list(message: String) -> ProviderError {
    ProviderError::BadResponse {
        action: "ListCertificates".into(),
        message,
    }
}

/// SHA-256 over the DER bytes of the first CERTIFICATE block.
fn extract_cert_fingerprint(cert_pem: &str) -> anyhow::Result<String> {
    let mut in_block = false;
    let mut b64 = String::new();

    for line in cert_pem.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            in_block = true;
            continue;
        }
        if line == "-----END CERTIFICATE-----" {
            if in_block {
                let der = BASE64
                    .decode(b64.as_bytes())
                    .map_err(|err| anyhow::anyhow!("invalid certificate base64: {err}"))?;
                return Ok(format!("{:x}", Sha256::digest(&der)));
            }
            in_block = false;
        }
        if in_block {
            b64.push_str(line);
        }
    }

    anyhow::bail!("no CERTIFICATE block found in pem input")
}

/// Lowercase alphanumerics only, leading zeros stripped; used to compare
/// fingerprints that providers format differently (colons, case).
fn normalize_comparable_token(raw: &str) -> String {
    let filtered: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let stripped = filtered.trim_start_matches('0');
    if stripped.is_empty() {
        if filtered.is_empty() {
            String::new()
        } else {
            "0".to_string()
        }
    } else {
        stripped.to_string()
    }
}

/// `{base≤12}-{UTC yyyymmddHHMMSS}-{µs:06}` where base prefers the remark,
/// then the domain, then a fixed default.
fn build_unique_certificate_name(name: &str, domain: &str, now: DateTime<Utc>) -> String {
    let mut base = "anssl".to_string();
    let domain_base = sanitize_certificate_name_base(domain);
    if !domain_base.is_empty() {
        base = domain_base;
    }
    let remark_base = sanitize_certificate_name_base(name);
    if !remark_base.is_empty() {
        base = remark_base;
    }

    let truncated: String = base.chars().take(12).collect();
    let time_suffix = now.format("%Y%m%d%H%M%S");
    let micro_suffix = (now.nanosecond() / 1000) % 1_000_000;
    format!("{truncated}-{time_suffix}-{micro_suffix:06}")
}

/// Keep letters, digits, `.`, `_`, `-`; collapse anything else to a single
/// dash, then trim dash/underscore/dot edges.
fn sanitize_certificate_name_base(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut last_dash = false;
    for ch in trimmed.chars() {
        if ch.is_alphabetic() || ch.is_ascii_digit() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    out.trim_matches(|c| c == '-' || c == '_' || c == '.')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use serde_json::json;

    fn cas_provider(url: String) -> AliyunProvider {
        AliyunProvider::new("id".into(), "secret".into(), String::new())
            .with_endpoints(url, "http://unused.invalid".into())
    }

    fn esa_provider(url: String) -> AliyunProvider {
        AliyunProvider::new("id".into(), "secret".into(), "123".into())
            .with_endpoints("http://unused.invalid".into(), url)
    }

    fn test_pem() -> String {
        // The fingerprint only hashes the DER bytes, so any base64 body
        // works for tests.
        let der = b"not-really-der-but-stable-bytes";
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            BASE64.encode(der)
        )
    }

    fn fingerprint_of_test_pem() -> String {
        format!("{:x}", Sha256::digest(b"not-really-der-but-stable-bytes"))
    }

    #[test]
    fn signature_is_stable_and_sorted() {
        let params = vec![
            ("Action".to_string(), "ListCsr".to_string()),
            ("AccessKeyId".to_string(), "id".to_string()),
        ];
        let a = rpc_signature("secret", "GET", &params);
        let reordered = vec![params[1].clone(), params[0].clone()];
        let b = rpc_signature("secret", "GET", &reordered);
        assert_eq!(a, b, "order of input params must not matter");
        assert_ne!(a, rpc_signature("other", "GET", &params));
    }

    #[test]
    fn sign_encode_follows_rfc3986() {
        assert_eq!(sign_encode("a b"), "a%20b");
        assert_eq!(sign_encode("a*b"), "a%2Ab");
        assert_eq!(sign_encode("a~b"), "a~b");
        assert_eq!(sign_encode("a/b"), "a%2Fb");
        assert_eq!(sign_encode("a_b-c.d"), "a_b-c.d");
    }

    #[test]
    fn unique_name_prefers_provided_name() {
        let now = Utc.with_ymd_and_hms(2026, 2, 26, 20, 30, 45).unwrap();
        assert_eq!(
            build_unique_certificate_name("my-cert", "domain.example.com", now),
            "my-cert-20260226203045-000000"
        );
    }

    #[test]
    fn unique_name_falls_back_to_domain_then_default() {
        let now = Utc.with_ymd_and_hms(2026, 2, 26, 20, 30, 45).unwrap();
        assert_eq!(
            build_unique_certificate_name("   ", "domain.example.com", now),
            "domain.examp-20260226203045-000000"
        );
        assert_eq!(
            build_unique_certificate_name("   ", "   ", now),
            "anssl-20260226203045-000000"
        );
    }

    #[test]
    fn unique_name_sanitizes_and_truncates() {
        let now = Utc.with_ymd_and_hms(2026, 2, 26, 20, 30, 45).unwrap();
        assert_eq!(
            build_unique_certificate_name(
                "1000.xiyun.vip_2026-02-26 20:21:22",
                "domain.example.com",
                now
            ),
            "1000.xiyun.v-20260226203045-000000"
        );

        let long = "a".repeat(70);
        assert_eq!(
            build_unique_certificate_name(&long, "d", now),
            format!("{}-20260226203045-000000", "a".repeat(12))
        );
    }

    #[test]
    fn sanitize_collapses_invalid_runs() {
        assert_eq!(sanitize_certificate_name_base("a  b"), "a-b");
        assert_eq!(sanitize_certificate_name_base("__a__"), "a");
        assert_eq!(sanitize_certificate_name_base("***"), "");
        assert_eq!(sanitize_certificate_name_base("a.b_c-d"), "a.b_c-d");
    }

    #[test]
    fn normalize_token_strips_separators_and_leading_zeros() {
        assert_eq!(normalize_comparable_token("AB:CD:00"), "abcd00");
        assert_eq!(normalize_comparable_token("00ff"), "ff");
        assert_eq!(normalize_comparable_token("0000"), "0");
        assert_eq!(normalize_comparable_token(""), "");
    }

    #[test]
    fn select_by_name_requires_unique_non_free_match() {
        let records = vec![
            json!({"Id": "1001", "Name": "example-cert", "Type": "upload"}),
            json!({"id": "1002", "name": "other-cert", "type": "upload"}),
        ];
        assert_eq!(
            select_certificate_id_by_name(&records, "example-cert").expect("id"),
            "1001"
        );
        // lowercase keys also resolve
        assert_eq!(
            select_certificate_id_by_name(&records, "other-cert").expect("id"),
            "1002"
        );

        let free = vec![json!({"Id": "1", "Name": "n", "Type": "free"})];
        assert!(select_certificate_id_by_name(&free, "n").is_err());

        let dupes = vec![
            json!({"Id": "1", "Name": "n", "Type": "upload"}),
            json!({"Id": "2", "Name": "n", "Type": "upload"}),
        ];
        assert!(select_certificate_id_by_name(&dupes, "n").is_err());

        assert!(select_certificate_id_by_name(&records, "missing").is_err());
    }

    #[test]
    fn select_by_fingerprint_normalizes_formats() {
        let records = vec![
            json!({"Id": "1", "FingerprintSha256": "AB:CD:EF"}),
            json!({"Id": "2", "Fingerprint": "112233"}),
        ];
        assert_eq!(
            select_certificate_id_by_fingerprint(&records, "abcdef").expect("id"),
            "1"
        );
        assert_eq!(
            select_certificate_id_by_fingerprint(&records, "11:22:33").expect("id"),
            "2"
        );
        assert!(select_certificate_id_by_fingerprint(&records, "999").is_err());
    }

    #[test]
    fn fingerprint_extraction_hashes_der_bytes() {
        let fingerprint = extract_cert_fingerprint(&test_pem()).expect("fingerprint");
        assert_eq!(fingerprint, fingerprint_of_test_pem());

        assert!(extract_cert_fingerprint("no pem here").is_err());
    }

    #[test]
    fn record_array_is_found_under_wrapper_keys() {
        let direct = json!({"Result": [{"Id": "1"}], "TotalCount": 1});
        assert_eq!(find_certificate_records(&direct).expect("records").len(), 1);

        let nested = json!({"body": {"CertificateList": [{"CertId": "9"}]}});
        assert_eq!(find_certificate_records(&nested).expect("records").len(), 1);

        let empty = json!({"Result": [], "TotalCount": 0});
        assert!(find_certificate_records(&empty).is_none());
    }

    #[tokio::test]
    async fn cas_upload_sends_signed_query() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "UploadUserCertificate")
                    .query_param("Version", CAS_VERSION)
                    .query_param("Name", "my-cert")
                    .query_param("Cert", "CERT")
                    .query_param("Key", "KEY")
                    .query_param_exists("Signature")
                    .query_param_exists("SignatureNonce");
                then.status(200).json_body(json!({"RequestId": "r-1"}));
            })
            .await;

        cas_provider(server.url(""))
            .upload_certificate("my-cert", "a.example", "CERT", "KEY")
            .await
            .expect("upload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cas_api_error_carries_code_and_request_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(400).json_body(json!({
                    "Code": "InvalidAccessKeyId.NotFound",
                    "Message": "key not found",
                    "RequestId": "r-2"
                }));
            })
            .await;

        let err = cas_provider(server.url(""))
            .test_connection()
            .await
            .expect_err("should fail");
        let message = err.to_string();
        assert!(message.contains("InvalidAccessKeyId.NotFound"), "{message}");
        assert!(message.contains("r-2"), "{message}");
        assert!(message.contains("ListCsr"), "{message}");
    }

    #[tokio::test]
    async fn esa_duplicate_resolves_by_name_and_updates_by_id() {
        let server = MockServer::start_async().await;
        // First SetCertificate without Id: duplicated.
        let duplicated = server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .query_param("Name", "my-cert")
                    .matches(|req| {
                        !req.query_params
                            .as_ref()
                            .map(|params| params.iter().any(|(k, _)| k == "Id"))
                            .unwrap_or(false)
                    });
                then.status(400).json_body(json!({
                    "Code": "Certificate.Duplicated",
                    "Message": "duplicated",
                    "RequestId": "r-3"
                }));
            })
            .await;

        let list = server
            .mock_async(|when, then| {
                when.method(GET).query_param("Action", "ListCertificates");
                then.status(200).json_body(json!({
                    "Result": [{"Id": "4242", "Name": "my-cert", "Type": "upload"}],
                    "TotalCount": 1,
                    "RequestId": "r-4"
                }));
            })
            .await;

        let update = server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .query_param("Id", "4242");
                then.status(200).json_body(json!({"RequestId": "r-5"}));
            })
            .await;

        esa_provider(server.url(""))
            .upload_certificate("my-cert", "a.example", &test_pem(), "KEY")
            .await
            .expect("upload");

        duplicated.assert_async().await;
        list.assert_async().await;
        update.assert_async().await;
    }

    #[tokio::test]
    async fn esa_duplicate_falls_back_to_fingerprint_match() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .matches(|req| {
                        !req.query_params
                            .as_ref()
                            .map(|params| params.iter().any(|(k, _)| k == "Id"))
                            .unwrap_or(false)
                    });
                then.status(400).json_body(json!({
                    "Code": "Certificate.Duplicated",
                    "Message": "duplicated",
                    "RequestId": "r-6"
                }));
            })
            .await;

        let fingerprint = fingerprint_of_test_pem();
        server
            .mock_async(move |when, then| {
                when.method(GET).query_param("Action", "ListCertificates");
                then.status(200).json_body(json!({
                    // Name does not match, fingerprint does.
                    "Result": [{"Id": "777", "Name": "stored-under-other-name",
                                "Type": "upload", "FingerprintSha256": fingerprint}],
                    "TotalCount": 1
                }));
            })
            .await;

        let update = server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .query_param("Id", "777");
                then.status(200).json_body(json!({"RequestId": "r-7"}));
            })
            .await;

        esa_provider(server.url(""))
            .upload_certificate("my-cert", "a.example", &test_pem(), "KEY")
            .await
            .expect("upload");
        update.assert_async().await;
    }

    #[tokio::test]
    async fn esa_duplicate_retries_under_unique_fallback_name() {
        let server = MockServer::start_async().await;
        // Duplicate on the original name only.
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .query_param("Name", "my-cert");
                then.status(400).json_body(json!({
                    "Code": "Certificate.Duplicated",
                    "Message": "duplicated"
                }));
            })
            .await;

        // Nothing matches by name or fingerprint.
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("Action", "ListCertificates");
                then.status(200).json_body(json!({
                    "Result": [{"Id": "1", "Name": "unrelated", "Type": "upload"}],
                    "TotalCount": 1
                }));
            })
            .await;

        let fallback = server
            .mock_async(|when, then| {
                when.method(GET)
                    .query_param("Action", "SetCertificate")
                    .matches(|req| {
                        let params = match req.query_params.as_ref() {
                            Some(params) => params,
                            None => return false,
                        };
                        if params.iter().any(|(k, _)| k == "Id") {
                            return false;
                        }
                        // Unique fallback shape: my-cert-{14 digits}-{6 digits}
                        params.iter().any(|(k, v)| {
                            k == "Name"
                                && v.starts_with("my-cert-")
                                && v.len() == "my-cert-".len() + 14 + 1 + 6
                                && v.ends_with(|c: char| c.is_ascii_digit())
                        })
                    });
                then.status(200).json_body(json!({"RequestId": "r-8"}));
            })
            .await;

        esa_provider(server.url(""))
            .upload_certificate("my-cert", "a.example", &test_pem(), "KEY")
            .await
            .expect("upload");
        fallback.assert_async().await;
    }
}
