//! Reachability probes

use crate::common::dialer::{DialError, Dialer};
use crate::common::net::BoxedStream;
use crate::server::{ServerEntry, CAPABILITY_FRONTED_MEEK, MEEK_CAPABILITIES};
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Port fronted meek traffic is addressed to
const FRONTED_MEEK_PORT: u16 = 443;

/// An established probe connection
pub struct ProbeConnection {
    pub stream: BoxedStream,
    /// Endpoint the stream is connected to; later relay channels reuse it
    pub host: String,
    pub port: u16,
    pub relay_protocol: &'static str,
}

impl fmt::Debug for ProbeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("relay_protocol", &self.relay_protocol)
            .finish()
    }
}

/// Opens a raw connection to a candidate's test port
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        entry: &ServerEntry,
        connect_timeout: Duration,
    ) -> Result<ProbeConnection, DialError>;
}

/// Outcome of probing one candidate in one round
#[derive(Debug)]
pub struct ProbeResult {
    pub entry: ServerEntry,
    pub responded: bool,
    pub response_time: Duration,
    pub live_connection: Option<ProbeConnection>,
    pub failure: Option<String>,
    pub(crate) upstream_proxy_failure: bool,
}

impl ProbeResult {
    pub fn responded(entry: ServerEntry, response_time: Duration, conn: ProbeConnection) -> Self {
        ProbeResult {
            entry,
            responded: true,
            response_time,
            live_connection: Some(conn),
            failure: None,
            upstream_proxy_failure: false,
        }
    }

    pub fn failed(entry: ServerEntry, response_time: Duration, error: &DialError) -> Self {
        ProbeResult {
            entry,
            responded: false,
            response_time,
            live_connection: None,
            failure: Some(error.to_string()),
            upstream_proxy_failure: error.is_upstream_proxy(),
        }
    }

    pub fn timed_out(entry: ServerEntry, response_time: Duration) -> Self {
        ProbeResult {
            entry,
            responded: false,
            response_time,
            live_connection: None,
            failure: Some("timed out".into()),
            upstream_proxy_failure: false,
        }
    }

    pub fn response_time_ms(&self) -> u64 {
        self.response_time.as_millis() as u64
    }
}

/// TCP prober: direct or through the upstream proxy, optionally taking the
/// relay-helper (meek) path for meek-capable entries
pub struct NetworkProber {
    dialer: Dialer,
    relay_helper_probability: f64,
}

impl NetworkProber {
    pub fn new(dialer: Dialer, relay_helper_probability: f64) -> Self {
        NetworkProber {
            dialer,
            relay_helper_probability: relay_helper_probability.clamp(0.0, 1.0),
        }
    }

    /// Pick the endpoint and relay protocol for this attempt
    pub fn target(&self, entry: &ServerEntry) -> Option<(String, u16, &'static str)> {
        if entry.has_meek() && rand::thread_rng().gen_bool(self.relay_helper_probability) {
            if let Some(target) = relay_helper_target(entry) {
                return Some(target);
            }
        }
        entry
            .reachability_test_port()
            .map(|port| (entry.ip_address.clone(), port, entry.relay_protocol()))
    }
}

fn relay_helper_target(entry: &ServerEntry) -> Option<(String, u16, &'static str)> {
    let meek = entry.meek.as_ref()?;
    if entry.has_capability(CAPABILITY_FRONTED_MEEK) {
        if let Some(address) = meek.fronting.as_ref().and_then(|f| f.addresses.first()) {
            return Some((address.clone(), FRONTED_MEEK_PORT, CAPABILITY_FRONTED_MEEK));
        }
    }
    let protocol = MEEK_CAPABILITIES
        .iter()
        .find(|c| **c != CAPABILITY_FRONTED_MEEK && entry.has_capability(**c))?;
    meek.server_port
        .map(|port| (entry.ip_address.clone(), port, *protocol))
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(
        &self,
        entry: &ServerEntry,
        connect_timeout: Duration,
    ) -> Result<ProbeConnection, DialError> {
        let Some((host, port, relay_protocol)) = self.target(entry) else {
            return Err(DialError::Target(crate::Error::unsupported(format!(
                "{} has no test port",
                entry.ip_address
            ))));
        };
        trace!("Probing {} via {}:{} ({})", entry.ip_address, host, port, relay_protocol);
        let stream = self.dialer.connect(&host, port, connect_timeout).await?;
        Ok(ProbeConnection {
            stream: Box::new(stream),
            host,
            port,
            relay_protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerEntryFields, CAPABILITY_OSSH, CAPABILITY_UNFRONTED_MEEK};
    use tokio::net::TcpListener;

    fn entry(fields: ServerEntryFields) -> ServerEntry {
        ServerEntry::decode(&fields.encode().unwrap()).unwrap()
    }

    fn base(ip: &str, obfuscated_port: i64) -> ServerEntryFields {
        ServerEntryFields {
            ip_address: ip.into(),
            web_server_port: 8443,
            web_server_secret: "s".into(),
            web_server_certificate: "c".into(),
            ssh_port: 22,
            ssh_obfuscated_port: obfuscated_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_uses_obfuscated_port() {
        let prober = NetworkProber::new(Dialer::direct(), 0.5);
        let target = prober.target(&entry(base("192.0.2.1", 443))).unwrap();
        assert_eq!(target, ("192.0.2.1".to_string(), 443, CAPABILITY_OSSH));
    }

    #[test]
    fn test_relay_helper_path_when_certain() {
        let mut fields = base("192.0.2.2", 443);
        fields.capabilities = Some(vec![CAPABILITY_UNFRONTED_MEEK.into()]);
        fields.meek_server_port = Some(8080);
        fields.meek_cookie_encryption_public_key = Some("k".into());
        fields.meek_obfuscated_key = Some("o".into());

        let always = NetworkProber::new(Dialer::direct(), 1.0);
        assert_eq!(
            always.target(&entry(fields.clone())).unwrap(),
            ("192.0.2.2".to_string(), 8080, CAPABILITY_UNFRONTED_MEEK)
        );

        let never = NetworkProber::new(Dialer::direct(), 0.0);
        assert_eq!(never.target(&entry(fields)).unwrap().1, 443);
    }

    #[tokio::test]
    async fn test_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = NetworkProber::new(Dialer::direct(), 0.0);

        let conn = prober
            .probe(&entry(base("127.0.0.1", port as i64)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.port, port);
        assert_eq!(conn.relay_protocol, CAPABILITY_OSSH);
    }
}
