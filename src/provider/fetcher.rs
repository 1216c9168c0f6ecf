//! Rate-limited fetch of the signed remote server list

use super::verifier::SignedListVerifier;
use crate::common::error::FetchError;
use crate::config::{RemoteServerListConfig, UpstreamProxyConfig};
use crate::platform::NetworkMonitor;
use crate::server::{MergeStats, ServerEntryStore};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait after a successful fetch
pub const FETCH_INTERVAL_ON_SUCCESS: Duration = Duration::from_secs(6 * 60 * 60);

/// Wait after a failed or gated fetch
pub const FETCH_INTERVAL_ON_FAILURE: Duration = Duration::from_secs(5 * 60);

/// Connectivity polling interval
pub const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Give up waiting for connectivity after this long
pub const MAX_CONNECTIVITY_WAIT: Duration = Duration::from_secs(60);

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport for the signed package
#[async_trait]
pub trait ListDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// reqwest-based downloader, optionally through an upstream HTTP proxy
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(upstream_proxy: Option<&UpstreamProxyConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT);
        if let Some(proxy) = upstream_proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy.url())
                    .map_err(|e| Error::config(format!("upstream proxy: {}", e)))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| Error::internal(format!("HTTP client: {}", e)))?;
        Ok(HttpDownloader { client })
    }
}

#[async_trait]
impl ListDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::connection(format!(
                "remote server list returned HTTP {}",
                resp.status()
            )));
        }
        let content = resp.bytes().await?;
        Ok(content.to_vec())
    }
}

/// Fetches, authenticates and merges the remote server list at most once
/// per interval
pub struct RemoteListFetcher {
    source: RemoteServerListConfig,
    store: Arc<ServerEntryStore>,
    verifier: Arc<dyn SignedListVerifier>,
    downloader: Arc<dyn ListDownloader>,
    network: Arc<dyn NetworkMonitor>,
    /// None until the first attempt
    next_fetch: Mutex<Option<Instant>>,
    max_connectivity_wait: Duration,
}

impl RemoteListFetcher {
    pub fn new(
        source: RemoteServerListConfig,
        store: Arc<ServerEntryStore>,
        verifier: Arc<dyn SignedListVerifier>,
        downloader: Arc<dyn ListDownloader>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        RemoteListFetcher {
            source,
            store,
            verifier,
            downloader,
            network,
            next_fetch: Mutex::new(None),
            max_connectivity_wait: MAX_CONNECTIVITY_WAIT,
        }
    }

    pub fn with_max_connectivity_wait(mut self, wait: Duration) -> Self {
        self.max_connectivity_wait = wait;
        self
    }

    /// Instant after which the next fetch may run
    pub fn next_fetch(&self) -> Option<Instant> {
        *self.next_fetch.lock()
    }

    /// Fetch and merge if the rate limit allows it.
    ///
    /// The next eligible time is pushed out by the short interval before any
    /// network activity, and by the long interval on success.
    pub async fn fetch_if_due(
        &self,
        now: Instant,
        stop: &CancellationToken,
    ) -> std::result::Result<MergeStats, FetchError> {
        {
            let mut next = self.next_fetch.lock();
            if let Some(at) = *next {
                if now < at {
                    return Err(FetchError::NotDue);
                }
            }
            *next = Some(now + FETCH_INTERVAL_ON_FAILURE);
        }

        self.wait_for_connectivity(stop).await?;

        info!("Fetching remote server list");
        let package = tokio::select! {
            result = self.downloader.download(&self.source.url) => {
                result.map_err(|e| FetchError::TransportError(e.to_string()))?
            }
            _ = stop.cancelled() => return Err(FetchError::Stopped),
        };

        let data = self
            .verifier
            .verify(&package, &self.source.signature_public_key)
            .map_err(|e| {
                warn!("Remote server list rejected: {}", e);
                FetchError::AuthenticationFailed(e.to_string())
            })?;

        let lines: Vec<&str> = data.split('\n').filter(|l| !l.trim().is_empty()).collect();
        let stats = self.store.merge_discovered(&lines, true);
        info!(
            "Remote server list merged: {} new, {} updated",
            stats.inserted, stats.replaced
        );

        *self.next_fetch.lock() = Some(now + FETCH_INTERVAL_ON_SUCCESS);
        Ok(stats)
    }

    async fn wait_for_connectivity(
        &self,
        stop: &CancellationToken,
    ) -> std::result::Result<(), FetchError> {
        let deadline = Instant::now() + self.max_connectivity_wait;
        loop {
            if stop.is_cancelled() {
                return Err(FetchError::Stopped);
            }
            if self.network.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FetchError::NetworkUnavailable);
            }
            debug!("Waiting for network connectivity");
            tokio::select! {
                _ = sleep(CONNECTIVITY_POLL_INTERVAL) => {}
                _ = stop.cancelled() => return Err(FetchError::Stopped),
            }
        }
    }
}
