//! Alibaba Cloud SLB gateway adapter.
//!
//! Talks to the SLB OpenAPI (version 2014-05-15) over HTTPS with
//! ACS3-HMAC-SHA256 request signing. Backends are taken out of rotation by
//! setting their weight to 0 via `SetBackendServers`, which keeps the pool
//! membership intact and makes both directions naturally idempotent; the
//! backend set itself comes from `DescribeHealthStatus` on the listener.

use std::collections::BTreeSet;

use chrono::Utc;
use hmac::{Hmac, Mac as _};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use super::GatewayError;
use crate::config::SlbCredentials;

const API_VERSION: &str = "2014-05-15";
const SIGNATURE_PREFIX: &str = "ACS3-HMAC-SHA256";
const WEIGHT_IN_ROTATION: u8 = 100;
const WEIGHT_OUT_OF_ROTATION: u8 = 0;

/// RFC 3986: unreserved characters stay as-is, everything else is encoded.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// One site's SLB listener plus the account credentials.
pub struct SlbGateway {
    client: reqwest::Client,
    access_key: String,
    secret: String,
    endpoint: String,
    load_balancer_id: String,
    listener_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthStatusResponse {
    backend_servers: BackendServerList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BackendServerList {
    backend_server: Vec<BackendServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BackendServer {
    server_id: String,
    server_ip: String,
    port: u16,
}

impl BackendServer {
    fn address(&self) -> String {
        format!("{}:{}", self.server_ip, self.port)
    }
}

impl SlbGateway {
    pub(crate) fn new(
        credentials: &SlbCredentials,
        load_balancer_id: String,
        listener_port: u16,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_key: credentials.access_key.clone(),
            secret: credentials.secret.clone(),
            endpoint: format!("slb.{}.aliyuncs.com", credentials.region),
            load_balancer_id,
            listener_port,
        }
    }

    pub(crate) async fn fetch_servers(&self) -> Result<BTreeSet<String>, GatewayError> {
        let entries = self.backend_entries().await?;
        Ok(entries.iter().map(BackendServer::address).collect())
    }

    pub(crate) async fn offline(&self, server: &str) -> Result<(), GatewayError> {
        info!(%server, listener = self.listener_port, "setting backend weight to 0");
        self.set_weight(server, WEIGHT_OUT_OF_ROTATION).await
    }

    pub(crate) async fn online(&self, server: &str) -> Result<(), GatewayError> {
        info!(%server, listener = self.listener_port, "restoring backend weight");
        self.set_weight(server, WEIGHT_IN_ROTATION).await
    }

    async fn backend_entries(&self) -> Result<Vec<BackendServer>, GatewayError> {
        let body = self
            .rpc(
                "DescribeHealthStatus",
                &[
                    ("LoadBalancerId", self.load_balancer_id.clone()),
                    ("ListenerPort", self.listener_port.to_string()),
                ],
            )
            .await?;
        let parsed: HealthStatusResponse =
            serde_json::from_value(body).map_err(|err| GatewayError::Api {
                code: "MalformedResponse".to_string(),
                message: err.to_string(),
            })?;
        Ok(parsed.backend_servers.backend_server)
    }

    async fn set_weight(&self, server: &str, weight: u8) -> Result<(), GatewayError> {
        let entries = self.backend_entries().await?;
        let entry = entries
            .into_iter()
            .find(|entry| entry.address() == server)
            .ok_or_else(|| GatewayError::UnknownBackend {
                server: server.to_string(),
            })?;
        let backends =
            serde_json::json!([{"ServerId": entry.server_id, "Weight": weight}]).to_string();
        self.rpc(
            "SetBackendServers",
            &[
                ("LoadBalancerId", self.load_balancer_id.clone()),
                ("BackendServers", backends),
            ],
        )
        .await?;
        Ok(())
    }

    /// One signed RPC-style GET against the SLB endpoint.
    async fn rpc(
        &self,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, GatewayError> {
        let query = canonical_query(params);
        let payload_hash = hex::encode(Sha256::digest(b""));
        let date = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let nonce = format!("{:032x}", rand::random::<u128>());
        // Kept sorted by header name; the canonical form requires it.
        let headers = [
            ("host", self.endpoint.as_str()),
            ("x-acs-action", action),
            ("x-acs-content-sha256", payload_hash.as_str()),
            ("x-acs-date", date.as_str()),
            ("x-acs-signature-nonce", nonce.as_str()),
            ("x-acs-version", API_VERSION),
        ];
        let canonical = canonical_request("GET", "/", &query, &headers, &payload_hash);
        let string_to_sign = format!(
            "{SIGNATURE_PREFIX}\n{}",
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );
        let signature = sign(&self.secret, &string_to_sign);
        let authorization = format!(
            "{SIGNATURE_PREFIX} Credential={},SignedHeaders={},Signature={signature}",
            self.access_key,
            signed_header_names(&headers),
        );
        debug!(action, query, "calling SLB API");

        let mut request = self
            .client
            .get(format!("https://{}/?{query}", self.endpoint))
            .header("Authorization", authorization);
        // `host` is derived from the URL by the client itself.
        for (name, value) in headers.iter().skip(1) {
            request = request.header(*name, *value);
        }
        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if let Some(code) = body.get("Code").and_then(serde_json::Value::as_str) {
            return Err(GatewayError::Api {
                code: code.to_string(),
                message: body
                    .get("Message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::Api {
                code: status.to_string(),
                message: "unexpected response status".to_string(),
            });
        }
        Ok(body)
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE).to_string()
}

/// Percent-encodes and sorts the query parameters as the signature expects.
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (encode(key), encode(value)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn signed_header_names(headers: &[(&str, &str)]) -> String {
    headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";")
}

fn canonical_request(
    method: &str,
    uri: &str,
    query: &str,
    headers: &[(&str, &str)],
    payload_hash: &str,
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    format!(
        "{method}\n{uri}\n{query}\n{canonical_headers}\n{}\n{payload_hash}",
        signed_header_names(headers)
    )
}

fn sign(secret: &str, string_to_sign: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_sorted_and_percent_encoded() {
        let query = canonical_query(&[
            ("ListenerPort", "80".to_string()),
            ("BackendServers", r#"[{"ServerId":"i-x","Weight":0}]"#.to_string()),
            ("LoadBalancerId", "lb-2zexample".to_string()),
        ]);
        let keys: Vec<&str> = query.split('&').map(|p| p.split('=').next().unwrap_or("")).collect();
        assert_eq!(keys, ["BackendServers", "ListenerPort", "LoadBalancerId"]);
        assert!(
            query.contains("%22ServerId%22"),
            "JSON punctuation must be encoded: {query}"
        );
        assert!(!query.contains('"'), "no raw quotes may survive: {query}");
    }

    #[test]
    fn unreserved_characters_survive_encoding() {
        assert_eq!(encode("lb-2z_ex.ample~"), "lb-2z_ex.ample~");
        assert_eq!(encode("a b:c"), "a%20b%3Ac");
    }

    #[test]
    fn canonical_request_layout_matches_the_signing_scheme() {
        let headers = [
            ("host", "slb.cn-hangzhou.aliyuncs.com"),
            ("x-acs-action", "DescribeHealthStatus"),
        ];
        let canonical = canonical_request("GET", "/", "A=1&B=2", &headers, "abc123");
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines[0], "GET");
        assert_eq!(lines[1], "/");
        assert_eq!(lines[2], "A=1&B=2");
        assert_eq!(lines[3], "host:slb.cn-hangzhou.aliyuncs.com");
        assert_eq!(lines[4], "x-acs-action:DescribeHealthStatus");
        assert_eq!(lines[5], "", "blank line between headers and their names");
        assert_eq!(lines[6], "host;x-acs-action");
        assert_eq!(lines[7], "abc123");
    }

    #[test]
    fn signature_is_hex_and_depends_on_the_secret() {
        let first = sign("secret-a", "ACS3-HMAC-SHA256\nabc");
        let again = sign("secret-a", "ACS3-HMAC-SHA256\nabc");
        let other = sign("secret-b", "ACS3-HMAC-SHA256\nabc");
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(first, again, "signing must be deterministic");
        assert_ne!(first, other, "different secrets must produce different signatures");
    }

    #[test]
    fn health_status_response_parses() {
        let body = serde_json::json!({
            "RequestId": "365F4154-92F6-4AE4-92F8-7FF34B540710",
            "BackendServers": {
                "BackendServer": [
                    {"ServerId": "i-abc", "ServerIp": "10.0.0.1", "Port": 8080,
                     "ServerHealthStatus": "normal"},
                    {"ServerId": "i-def", "ServerIp": "10.0.0.2", "Port": 8080,
                     "ServerHealthStatus": "abnormal"}
                ]
            }
        });
        let parsed: HealthStatusResponse =
            serde_json::from_value(body).expect("response should parse");
        assert_eq!(parsed.backend_servers.backend_server.len(), 2);
        assert_eq!(parsed.backend_servers.backend_server[0].address(), "10.0.0.1:8080");
    }
}
