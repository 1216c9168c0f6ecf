//! Server API: handshake, connected and status requests
//!
//! Requests run over a relay channel to the server's web port. Every
//! request carries the common session parameters built by [`RequestParams`].

mod https;

pub use https::{HttpsServerApi, PinnedCertVerifier};

use crate::config::ClientConfig;
use crate::server::ServerEntry;
use crate::statistic::{RegexReplace, StatusPayload};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Timeout for connected and periodic status requests
pub const HTTPS_REQUEST_SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the handshake request
pub const HTTPS_REQUEST_LONG_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for the final status request at teardown
pub const HTTPS_REQUEST_FINAL_TIMEOUT: Duration = Duration::from_secs(1);

const CONFIG_LINE_PREFIX: &str = "Config: ";

/// Session parameters attached to every request
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub entry: ServerEntry,
    pub client_session_id: String,
    pub relay_protocol: String,
    pub tunnel_whole_device: bool,
    pub client: ClientConfig,
}

impl RequestParams {
    /// Path and query string for `path`, common parameters first
    pub fn path_and_query(&self, path: &str, extra: &[(&str, String)]) -> String {
        let common = [
            ("client_session_id", self.client_session_id.as_str()),
            ("server_secret", self.entry.web_server_secret.as_str()),
            ("propagation_channel_id", self.client.propagation_channel_id.as_str()),
            ("sponsor_id", self.client.sponsor_id.as_str()),
            ("client_version", self.client.client_version.as_str()),
            ("relay_protocol", self.relay_protocol.as_str()),
            ("client_platform", self.client.platform.as_str()),
            (
                "tunnel_whole_device",
                if self.tunnel_whole_device { "1" } else { "0" },
            ),
        ];

        let mut query: Vec<String> = common
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        query.extend(
            extra
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v))),
        );
        format!("/{}?{}", path, query.join("&"))
    }
}

/// Session parameters returned by a handshake
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub homepages: Vec<String>,
    #[serde(default)]
    pub upgrade_client_version: Option<String>,
    #[serde(default)]
    pub page_view_regexes: Vec<RegexReplace>,
    #[serde(default)]
    pub https_request_regexes: Vec<RegexReplace>,
    #[serde(default)]
    pub encoded_server_list: Vec<String>,
    pub ssh_session_id: String,
    #[serde(default)]
    pub preemptive_reconnect_lifetime_milliseconds: Option<u64>,
}

impl HandshakeResponse {
    /// Parse a handshake body. The last `Config: ` line wins; a body without
    /// one is an error.
    pub fn parse(body: &str) -> Result<Self> {
        let mut parsed = None;
        for line in body.lines() {
            if let Some(json) = line.strip_prefix(CONFIG_LINE_PREFIX) {
                let mut response: HandshakeResponse = serde_json::from_str(json)?;
                if matches!(response.upgrade_client_version.as_deref(), Some("null" | "")) {
                    response.upgrade_client_version = None;
                }
                parsed = Some(response);
            }
        }
        parsed.ok_or_else(|| Error::protocol("handshake response has no config line"))
    }

    /// Advertised session lifetime, if any
    pub fn preemptive_reconnect_lifetime(&self) -> Option<Duration> {
        self.preemptive_reconnect_lifetime_milliseconds
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Deserialize)]
struct ConnectedResponse {
    connected_timestamp: String,
}

/// Parse a connected response, returning the server's timestamp
pub fn parse_connected(body: &str) -> Result<String> {
    let response: ConnectedResponse = serde_json::from_str(body)?;
    Ok(response.connected_timestamp)
}

/// Requests made to the selected server once the relay is up
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Handshake; `known_servers` lists the addresses already in the store
    async fn handshake(
        &self,
        params: &RequestParams,
        known_servers: &[String],
    ) -> Result<HandshakeResponse>;

    /// Connected notification; returns the server's connected timestamp
    async fn connected(
        &self,
        params: &RequestParams,
        server_session_id: &str,
        last_connected: &str,
    ) -> Result<String>;

    /// Status upload; `is_final` marks the teardown report
    async fn status(
        &self,
        params: &RequestParams,
        server_session_id: &str,
        payload: &StatusPayload,
        is_final: bool,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::entry_fixtures::encoded;

    fn params() -> RequestParams {
        let entry = ServerEntry::decode(&encoded("192.0.2.7")).unwrap();
        RequestParams {
            entry,
            client_session_id: "abc123".into(),
            relay_protocol: "OSSH".into(),
            tunnel_whole_device: true,
            client: ClientConfig {
                propagation_channel_id: "PC".into(),
                sponsor_id: "SP".into(),
                client_version: "42".into(),
                platform: "linux".into(),
            },
        }
    }

    #[test]
    fn test_path_and_query() {
        let p = params();
        let url = p.path_and_query(
            "handshake",
            &[("known_server", "10.0.0.1".into()), ("x", "a b&c".into())],
        );
        assert!(url.starts_with("/handshake?client_session_id=abc123&server_secret="));
        assert!(url.contains("&propagation_channel_id=PC&sponsor_id=SP&client_version=42"));
        assert!(url.contains("&relay_protocol=OSSH&client_platform=linux&tunnel_whole_device=1"));
        assert!(url.ends_with("&known_server=10.0.0.1&x=a%20b%26c"));
    }

    #[test]
    fn test_parse_handshake() {
        let body = "junk line\n\
            Config: {\"homepages\":[\"https://example.com/\"],\"upgrade_client_version\":\"null\",\
            \"page_view_regexes\":[{\"regex\":\"^www\\\\.\",\"replace\":\"\"}],\
            \"https_request_regexes\":[],\"encoded_server_list\":[\"00ff\"],\
            \"ssh_session_id\":\"sess\",\"preemptive_reconnect_lifetime_milliseconds\":60000}\n";
        let response = HandshakeResponse::parse(body).unwrap();
        assert_eq!(response.homepages, vec!["https://example.com/".to_string()]);
        assert_eq!(response.upgrade_client_version, None);
        assert_eq!(response.page_view_regexes.len(), 1);
        assert_eq!(response.encoded_server_list, vec!["00ff".to_string()]);
        assert_eq!(response.ssh_session_id, "sess");
        assert_eq!(
            response.preemptive_reconnect_lifetime(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_parse_handshake_requires_config_line() {
        assert!(HandshakeResponse::parse("no config here\n").is_err());
        assert!(HandshakeResponse::parse("Config: {not json").is_err());
    }

    #[test]
    fn test_parse_connected() {
        assert_eq!(
            parse_connected("{\"connected_timestamp\":\"2024-01-01T00:00:00Z\"}").unwrap(),
            "2024-01-01T00:00:00Z"
        );
        assert!(parse_connected("{}").is_err());
    }
}
