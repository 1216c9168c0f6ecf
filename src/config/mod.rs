//! Configuration module

use crate::selector;
use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Directory holding the persisted server list and last-connected stamp
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Log format (text, json)
    pub log_format: String,

    /// Egress region filter; empty means any region
    pub egress_region: String,

    /// Route all device traffic instead of just local proxy clients
    pub tunnel_whole_device: bool,

    /// Preferred local SOCKS5 port
    pub local_socks_port: u16,

    /// Preferred local HTTP proxy port
    pub local_http_port: u16,

    /// Local DNS proxy port (whole-device mode)
    pub local_dns_port: u16,

    /// Transparent proxy port (whole-device mode)
    pub transparent_proxy_port: u16,

    /// DNS server reached through the tunnel
    pub remote_dns: String,

    /// Upstream HTTP proxy used for probes and relay dials
    pub upstream_proxy: Option<UpstreamProxyConfig>,

    /// Hex-encoded server entries shipped with the client
    pub embedded_server_entries: Vec<String>,

    /// Signed remote server list
    pub remote_server_list: Option<RemoteServerListConfig>,

    /// Server selection tuning
    pub selector: SelectorConfig,

    /// Honour server-advertised session lifetimes
    pub preemptive_reconnect: bool,

    /// Parameters sent with every server API request
    pub client: ClientConfig,

    /// Status upload thresholds
    pub stats: StatsConfig,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, port) in [
            ("local-socks-port", self.local_socks_port),
            ("local-http-port", self.local_http_port),
            ("local-dns-port", self.local_dns_port),
            ("transparent-proxy-port", self.transparent_proxy_port),
        ] {
            if port == 0 {
                return Err(Error::config(format!("{} cannot be 0", name)));
            }
        }

        if self.remote_dns.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::config(format!(
                "remote-dns must be ip:port, got {}",
                self.remote_dns
            )));
        }

        if let Some(proxy) = &self.upstream_proxy {
            proxy.validate()?;
        }

        if let Some(remote) = &self.remote_server_list {
            remote.validate()?;
        }

        self.selector.validate()?;
        self.stats.validate()?;

        Ok(())
    }

    /// Path of the persisted server entry list
    pub fn server_entries_path(&self) -> PathBuf {
        self.data_dir.join(crate::server::SERVER_ENTRIES_FILE)
    }

    /// Path of the last-connected timestamp file
    pub fn last_connected_path(&self) -> PathBuf {
        self.data_dir.join(crate::server::LAST_CONNECTED_FILE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            egress_region: String::new(),
            tunnel_whole_device: false,
            local_socks_port: 1080,
            local_http_port: 8080,
            local_dns_port: 9053,
            transparent_proxy_port: 9080,
            remote_dns: "8.8.8.8:53".to_string(),
            upstream_proxy: None,
            embedded_server_entries: Vec::new(),
            remote_server_list: None,
            selector: SelectorConfig::default(),
            preemptive_reconnect: true,
            client: ClientConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// Upstream HTTP proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub host: String,
    pub port: u16,
}

impl UpstreamProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("upstream-proxy host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("upstream-proxy port cannot be 0"));
        }
        Ok(())
    }

    /// Proxy URL in the form reqwest expects
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Signed remote server list source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteServerListConfig {
    /// Download URL
    pub url: String,

    /// Base64 X.509 SubjectPublicKeyInfo of the signing key
    pub signature_public_key: String,
}

impl RemoteServerListConfig {
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url)
            .map_err(|e| Error::config(format!("remote-server-list url: {}", e)))?;
        base64::engine::general_purpose::STANDARD
            .decode(&self.signature_public_key)
            .map_err(|e| Error::config(format!("remote-server-list key: {}", e)))?;
        Ok(())
    }
}

/// Server selection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SelectorConfig {
    /// Overall probe budget
    pub budget_ms: u64,

    /// Parallel probes
    pub concurrency: usize,

    /// Result polling interval
    pub poll_interval_ms: u64,

    /// Per-probe connect timeout
    pub connect_timeout_ms: u64,

    /// Chance of probing a meek-capable entry through its relay helper
    pub relay_helper_probability: f64,
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config("selector concurrency must be at least 1"));
        }
        if self.budget_ms == 0 || self.poll_interval_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::config("selector timings must be positive"));
        }
        if !(0.0..=1.0).contains(&self.relay_helper_probability) {
            return Err(Error::config(
                "selector relay-helper-probability must be within [0, 1]",
            ));
        }
        Ok(())
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            budget_ms: selector::DEFAULT_BUDGET.as_millis() as u64,
            concurrency: selector::DEFAULT_CONCURRENCY,
            poll_interval_ms: selector::RESULTS_POLL_INTERVAL.as_millis() as u64,
            connect_timeout_ms: 20_000,
            relay_helper_probability: 0.5,
        }
    }
}

/// Parameters identifying this client to the server API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    pub client_version: String,
    pub platform: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            propagation_channel_id: "0".to_string(),
            sponsor_id: "0".to_string(),
            client_version: "1".to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Status upload thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatsConfig {
    pub interval_secs: u64,
    pub entry_threshold: usize,
}

impl StatsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 || self.entry_threshold == 0 {
            return Err(Error::config("stats thresholds must be positive"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            interval_secs: 300,
            entry_threshold: 1000,
        }
    }
}
