//! Server entry model and encoding
//!
//! An encoded entry is a hex string. Decoded, it is UTF-8 text carrying four
//! space-delimited legacy fields (ip, web port, web secret, web certificate)
//! followed by a JSON object with the full parameter set.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};

pub const CAPABILITY_OSSH: &str = "OSSH";
pub const CAPABILITY_SSH: &str = "SSH";
pub const CAPABILITY_VPN: &str = "VPN";
pub const CAPABILITY_HANDSHAKE: &str = "handshake";
pub const CAPABILITY_FRONTED_MEEK: &str = "FRONTED-MEEK";
pub const CAPABILITY_UNFRONTED_MEEK: &str = "UNFRONTED-MEEK";
pub const CAPABILITY_UNFRONTED_MEEK_HTTPS: &str = "UNFRONTED-MEEK-HTTPS";

/// Capabilities assumed for entries that predate the capabilities field
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    CAPABILITY_OSSH,
    CAPABILITY_SSH,
    CAPABILITY_VPN,
    CAPABILITY_HANDSHAKE,
];

/// An entry needs at least one of these to carry a tunnel
pub const SUFFICIENT_CAPABILITIES_FOR_TUNNEL: &[&str] = &[
    CAPABILITY_OSSH,
    CAPABILITY_FRONTED_MEEK,
    CAPABILITY_UNFRONTED_MEEK,
    CAPABILITY_UNFRONTED_MEEK_HTTPS,
];

pub const MEEK_CAPABILITIES: &[&str] = &[
    CAPABILITY_FRONTED_MEEK,
    CAPABILITY_UNFRONTED_MEEK,
    CAPABILITY_UNFRONTED_MEEK_HTTPS,
];

const LEGACY_FIELD_COUNT: usize = 4;

/// JSON body of an encoded server entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntryFields {
    pub ip_address: String,
    #[serde(deserialize_with = "de_int")]
    pub web_server_port: i64,
    pub web_server_secret: String,
    pub web_server_certificate: String,
    #[serde(default, deserialize_with = "de_int")]
    pub ssh_port: i64,
    #[serde(default)]
    pub ssh_username: String,
    #[serde(default)]
    pub ssh_password: String,
    #[serde(default)]
    pub ssh_host_key: String,
    #[serde(default, deserialize_with = "de_int")]
    pub ssh_obfuscated_port: i64,
    #[serde(default)]
    pub ssh_obfuscated_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_server_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_cookie_encryption_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_obfuscated_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_fronting_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_fronting_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_fronting_addresses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meek_fronting_addresses_regex: Option<String>,
}

impl ServerEntryFields {
    /// Produce the hex encoding, legacy prefix included
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        let text = format!(
            "{} {} {} {} {}",
            self.ip_address,
            self.web_server_port,
            self.web_server_secret,
            self.web_server_certificate,
            json
        );
        Ok(hex::encode(text.as_bytes()))
    }
}

/// Ports arrive as numbers or numeric strings
fn de_int<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn to_port(value: i64) -> Option<u16> {
    u16::try_from(value).ok().filter(|p| *p != 0)
}

/// Meek (HTTP-carried) transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeekParams {
    pub server_port: Option<u16>,
    pub cookie_encryption_public_key: String,
    pub obfuscated_key: String,
    pub fronting: Option<MeekFronting>,
}

/// Domain fronting parameters (FRONTED-MEEK only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeekFronting {
    pub domain: String,
    pub host: String,
    /// Never empty: falls back to `domain`
    pub addresses: Vec<String>,
    pub addresses_regex: String,
}

/// One candidate relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    raw_encoding: String,
    pub ip_address: String,
    pub web_server_port: u16,
    pub web_server_secret: String,
    pub web_server_certificate: String,
    pub ssh_port: Option<u16>,
    pub ssh_username: String,
    pub ssh_password: String,
    pub ssh_host_key: String,
    pub ssh_obfuscated_port: Option<u16>,
    pub ssh_obfuscated_key: String,
    pub capabilities: Vec<String>,
    pub region: String,
    pub meek: Option<MeekParams>,
}

impl ServerEntry {
    /// Decode a hex-encoded entry
    pub fn decode(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let bytes = hex::decode(encoded)
            .map_err(|e| Error::parse(format!("invalid encoded server entry: {}", e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::parse(format!("server entry is not UTF-8: {}", e)))?;

        let json = text
            .splitn(LEGACY_FIELD_COUNT + 1, ' ')
            .nth(LEGACY_FIELD_COUNT)
            .unwrap_or(&text);
        let fields: ServerEntryFields = serde_json::from_str(json)?;

        Self::from_fields(encoded.to_string(), fields)
    }

    fn from_fields(raw_encoding: String, fields: ServerEntryFields) -> Result<Self> {
        if fields.ip_address.is_empty() {
            return Err(Error::parse("server entry has no ipAddress"));
        }
        let web_server_port = to_port(fields.web_server_port).ok_or_else(|| {
            Error::parse(format!(
                "server entry {} has invalid webServerPort {}",
                fields.ip_address, fields.web_server_port
            ))
        })?;

        let capabilities = fields
            .capabilities
            .unwrap_or_else(|| DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect());

        let has = |cap: &str| capabilities.iter().any(|c| c == cap);

        let meek = if MEEK_CAPABILITIES.iter().any(|c| has(*c)) {
            let fronting = if has(CAPABILITY_FRONTED_MEEK) {
                let domain = fields.meek_fronting_domain.ok_or_else(|| {
                    Error::parse("FRONTED-MEEK entry has no meekFrontingDomain")
                })?;
                let mut addresses = fields.meek_fronting_addresses.unwrap_or_default();
                if addresses.is_empty() {
                    addresses.push(domain.clone());
                }
                Some(MeekFronting {
                    host: fields.meek_fronting_host.ok_or_else(|| {
                        Error::parse("FRONTED-MEEK entry has no meekFrontingHost")
                    })?,
                    domain,
                    addresses,
                    addresses_regex: fields.meek_fronting_addresses_regex.unwrap_or_default(),
                })
            } else {
                None
            };
            Some(MeekParams {
                server_port: fields.meek_server_port.and_then(to_port),
                cookie_encryption_public_key: fields
                    .meek_cookie_encryption_public_key
                    .unwrap_or_default(),
                obfuscated_key: fields.meek_obfuscated_key.unwrap_or_default(),
                fronting,
            })
        } else {
            None
        };

        Ok(ServerEntry {
            raw_encoding,
            ip_address: fields.ip_address,
            web_server_port,
            web_server_secret: fields.web_server_secret,
            web_server_certificate: fields.web_server_certificate,
            ssh_port: to_port(fields.ssh_port),
            ssh_username: fields.ssh_username,
            ssh_password: fields.ssh_password,
            ssh_host_key: fields.ssh_host_key,
            ssh_obfuscated_port: to_port(fields.ssh_obfuscated_port),
            ssh_obfuscated_key: fields.ssh_obfuscated_key,
            capabilities,
            region: fields.region.unwrap_or_default(),
            meek,
        })
    }

    /// Original encoding, byte-identical to what was decoded
    pub fn raw_encoding(&self) -> &str {
        &self.raw_encoding
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn has_any_capability(&self, capabilities: &[&str]) -> bool {
        capabilities.iter().any(|c| self.has_capability(*c))
    }

    /// Whether this entry can carry a tunnel at all
    pub fn is_tunnel_capable(&self) -> bool {
        self.has_any_capability(SUFFICIENT_CAPABILITIES_FOR_TUNNEL)
    }

    pub fn has_meek(&self) -> bool {
        self.has_any_capability(MEEK_CAPABILITIES)
    }

    /// Empty region filter matches every entry
    pub fn in_region(&self, region: &str) -> bool {
        region.is_empty() || self.region == region
    }

    /// Port a raw TCP reachability probe should target, if any
    pub fn reachability_test_port(&self) -> Option<u16> {
        if self.has_capability(CAPABILITY_OSSH) || self.has_meek() {
            self.ssh_obfuscated_port
        } else if self.has_capability(CAPABILITY_SSH) {
            self.ssh_port
        } else if self.has_capability(CAPABILITY_HANDSHAKE) {
            Some(self.web_server_port)
        } else {
            None
        }
    }

    /// Relay protocol label reported to the server API
    pub fn relay_protocol(&self) -> &'static str {
        if self.has_capability(CAPABILITY_OSSH) {
            CAPABILITY_OSSH
        } else if let Some(cap) = MEEK_CAPABILITIES.iter().find(|c| self.has_capability(*c)) {
            *cap
        } else {
            CAPABILITY_SSH
        }
    }

    pub fn meek_fronting_domain(&self) -> Option<&str> {
        self.meek
            .as_ref()
            .and_then(|m| m.fronting.as_ref())
            .map(|f| f.domain.as_str())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn fields(ip: &str) -> ServerEntryFields {
        ServerEntryFields {
            ip_address: ip.to_string(),
            web_server_port: 8443,
            web_server_secret: "secret".into(),
            web_server_certificate: "Y2VydA==".into(),
            ssh_port: 22,
            ssh_username: "user".into(),
            ssh_password: "pass".into(),
            ssh_host_key: "key".into(),
            ssh_obfuscated_port: 443,
            ssh_obfuscated_key: "okey".into(),
            ..Default::default()
        }
    }

    pub(crate) fn encoded(ip: &str) -> String {
        fields(ip).encode().unwrap()
    }

    #[test]
    fn test_decode_defaults() {
        let entry = ServerEntry::decode(&encoded("192.0.2.1")).unwrap();
        assert_eq!(entry.ip_address, "192.0.2.1");
        assert_eq!(entry.web_server_port, 8443);
        assert_eq!(entry.capabilities, DEFAULT_CAPABILITIES);
        assert_eq!(entry.region, "");
        assert!(entry.meek.is_none());
        assert!(entry.is_tunnel_capable());
        assert_eq!(entry.reachability_test_port(), Some(443));
        assert_eq!(entry.relay_protocol(), "OSSH");
    }

    #[test]
    fn test_raw_encoding_preserved() {
        let raw = encoded("192.0.2.2");
        let entry = ServerEntry::decode(&raw).unwrap();
        assert_eq!(entry.raw_encoding(), raw);
    }

    #[test]
    fn test_decode_string_ports() {
        let text = r#"192.0.2.3 80 s c {"ipAddress":"192.0.2.3","webServerPort":"8080","webServerSecret":"s","webServerCertificate":"c","sshPort":"22","sshObfuscatedPort":0}"#;
        let entry = ServerEntry::decode(&hex::encode(text)).unwrap();
        assert_eq!(entry.web_server_port, 8080);
        assert_eq!(entry.ssh_port, Some(22));
        assert_eq!(entry.ssh_obfuscated_port, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ServerEntry::decode("zz").is_err());
        assert!(ServerEntry::decode(&hex::encode("a b c d {not json}")).is_err());
        let mut f = fields("192.0.2.4");
        f.web_server_port = 0;
        assert!(ServerEntry::decode(&f.encode().unwrap()).is_err());
    }

    #[test]
    fn test_reachability_port_by_capability() {
        let mut f = fields("192.0.2.5");
        f.capabilities = Some(vec![CAPABILITY_SSH.into()]);
        let entry = ServerEntry::decode(&f.encode().unwrap()).unwrap();
        assert_eq!(entry.reachability_test_port(), Some(22));
        assert!(!entry.is_tunnel_capable());

        f.capabilities = Some(vec![CAPABILITY_HANDSHAKE.into()]);
        let entry = ServerEntry::decode(&f.encode().unwrap()).unwrap();
        assert_eq!(entry.reachability_test_port(), Some(8443));

        f.capabilities = Some(vec![CAPABILITY_VPN.into()]);
        let entry = ServerEntry::decode(&f.encode().unwrap()).unwrap();
        assert_eq!(entry.reachability_test_port(), None);
    }

    #[test]
    fn test_fronted_meek_fields() {
        let mut f = fields("192.0.2.6");
        f.capabilities = Some(vec![CAPABILITY_FRONTED_MEEK.into(), CAPABILITY_HANDSHAKE.into()]);
        f.region = Some("CA".into());
        f.meek_server_port = Some(8080);
        f.meek_fronting_domain = Some("front.example.com".into());
        f.meek_fronting_host = Some("meek.example.com".into());

        let entry = ServerEntry::decode(&f.encode().unwrap()).unwrap();
        assert!(entry.is_tunnel_capable());
        assert!(entry.in_region("CA"));
        assert!(entry.in_region(""));
        assert!(!entry.in_region("US"));
        assert_eq!(entry.meek_fronting_domain(), Some("front.example.com"));
        assert_eq!(entry.relay_protocol(), CAPABILITY_FRONTED_MEEK);

        let meek = entry.meek.as_ref().unwrap();
        assert_eq!(meek.server_port, Some(8080));
        assert_eq!(
            meek.fronting.as_ref().unwrap().addresses,
            vec!["front.example.com".to_string()]
        );
    }

    #[test]
    fn test_fronted_meek_requires_domain() {
        let mut f = fields("192.0.2.7");
        f.capabilities = Some(vec![CAPABILITY_FRONTED_MEEK.into()]);
        assert!(ServerEntry::decode(&f.encode().unwrap()).is_err());
    }
}
