//! Relay Tunnel - censorship circumvention tunnel client
//!
//! Keeps a persistent list of relay servers, picks the first one that
//! answers, authenticates a relay session over that connection and exposes
//! local SOCKS5, HTTP and DNS proxies that carry traffic through it.
//!
//! # Architecture
//!
//! ```text
//!                      +------------------+
//!                      |  tunnel/ (core)  |
//!                      +--------+---------+
//!                               |
//!      +------------+-----------+-----------+-------------+
//!      |            |           |           |             |
//! +----v----+ +-----v----+ +----v----+ +----v-----+ +-----v------+
//! |selector/| |  relay/  | |  api/   | | inbound/ | | statistic/ |
//! | (probe) | | (session)| | (HTTPS) | | (proxies)| |  (status)  |
//! +----+----+ +----------+ +---------+ +----------+ +------------+
//!      |
//! +----v----+     +-------------+
//! | server/ |<----+  provider/  |
//! | (store) |     | (remote list)|
//! +---------+     +-------------+
//! ```

pub mod api;
pub mod common;
pub mod config;
pub mod inbound;
pub mod platform;
pub mod provider;
pub mod relay;
pub mod selector;
pub mod server;
pub mod statistic;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use api::HttpsServerApi;
use common::dialer::Dialer;
use common::error::TunnelError;
use platform::Platform;
use provider::{HttpDownloader, RemoteListFetcher, RsaSha256Verifier};
use relay::{RelayHandle, Socks5RelayTransport};
use selector::{NetworkProber, ServerSelector};
use server::{LastConnected, ServerEntryStore};
use std::sync::Arc;
use tracing::{info, warn};
use tunnel::{EventSink, StatusLog, TunnelStateMachine};

/// Crate version, reported as the client version when none is configured
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fully wired tunnel client
pub struct Client {
    config: Arc<Config>,
    machine: Arc<TunnelStateMachine>,
}

impl Client {
    /// Build the client from configuration using the default platform
    pub fn new(config: Config) -> Result<Self> {
        Self::with_platform(config, Platform::default(), None)
    }

    /// Build the client with host-provided platform capabilities
    pub fn with_platform(
        mut config: Config,
        platform: Platform,
        events: Option<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        info!("Initializing Relay Tunnel v{}", VERSION);
        if config.client.client_version.is_empty() {
            config.client.client_version = VERSION.to_string();
        }

        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::persistence(format!(
                "cannot create data directory {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;

        // Store
        let store = Arc::new(ServerEntryStore::open(config.server_entries_path()));
        if !config.embedded_server_entries.is_empty() {
            let merged = store.merge_embedded(&config.embedded_server_entries, true);
            info!(
                "Embedded server entries: {} new, {} updated, {} kept",
                merged.inserted, merged.replaced, merged.kept
            );
        }
        info!("{} server entries available", store.len());

        // Selection and relay
        let dialer = Dialer::new(config.upstream_proxy.clone());
        let prober = Arc::new(NetworkProber::new(
            dialer.clone(),
            config.selector.relay_helper_probability,
        ));
        let selector = Arc::new(ServerSelector::new(
            store.clone(),
            prober,
            config.selector.clone(),
            config.egress_region.clone(),
        ));
        let transport = Arc::new(Socks5RelayTransport::new(dialer));
        let relay = Arc::new(RelayHandle::new());
        let api = Arc::new(HttpsServerApi::new(relay.clone()));

        let fetcher = match &config.remote_server_list {
            Some(source) => {
                let downloader = HttpDownloader::new(config.upstream_proxy.as_ref())?;
                Some(Arc::new(RemoteListFetcher::new(
                    source.clone(),
                    store.clone(),
                    Arc::new(RsaSha256Verifier),
                    Arc::new(downloader),
                    platform.network.clone(),
                )))
            }
            None => {
                warn!("No remote server list configured");
                None
            }
        };

        let last_connected = LastConnected::new(config.last_connected_path());
        let config = Arc::new(config);

        let mut machine = TunnelStateMachine::new(
            config.clone(),
            store,
            selector,
            transport,
            relay,
            api,
        )
        .with_platform(platform)
        .with_last_connected(last_connected);
        if let Some(fetcher) = fetcher {
            machine = machine.with_fetcher(fetcher);
        }
        if let Some(events) = events {
            machine = machine.with_events(events);
        }

        Ok(Client {
            config,
            machine: Arc::new(machine),
        })
    }

    /// Run until stopped or a fatal error
    pub async fn run(&self) -> std::result::Result<(), TunnelError> {
        info!("Starting tunnel");
        let result = self.machine.run().await;
        info!("Tunnel stopped");
        result
    }

    pub fn stop(&self) {
        self.machine.stop();
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn tunnel(&self) -> &Arc<TunnelStateMachine> {
        &self.machine
    }

    pub fn status(&self) -> &Arc<StatusLog> {
        self.machine.status()
    }
}
