//! Tunnel core: drives sessions from selection to teardown
//!
//! `run` loops `run_once` until a stop or a fatal error. Each attempt
//! selects a server, authenticates the relay over the probe connection,
//! starts the local listeners, performs the handshake and then maintains
//! the session until a signal ends it.

mod events;
mod session;
mod signal;

pub use events::{EventSink, NoopEventSink, Severity, StatusEntry, StatusLog, STATUS_HISTORY_SIZE};
pub use session::{
    new_client_session_id, preemptive_period, SessionContext, SessionStatusUploader, TunnelState,
};
pub use signal::{Signal, SignalQueue};

use crate::api::ServerApi;
use crate::common::error::{FetchError, TunnelError};
use crate::config::Config;
use crate::inbound::{
    self, DnsProxyListener, HttpProxyListener, LocalProxyListener, Socks5ProxyListener,
    TransparentProxyListener,
};
use crate::platform::{Platform, PrivilegeStatus};
use crate::provider::RemoteListFetcher;
use crate::relay::{
    RelayConnection, RelayCredentials, RelayEndpoint, RelayHandle, RelayTransport,
    SESSION_ESTABLISHMENT_TIMEOUT,
};
use crate::selector::{ProbeConnection, ServerSelector};
use crate::server::{LastConnected, ServerEntry, ServerEntryStore};
use crate::statistic::StatsReporter;
use parking_lot::RwLock;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type TunnelResult<T> = std::result::Result<T, TunnelError>;

/// Signal poll period of the maintenance loop
pub const MAINTENANCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connect timeout for the second connection of a preemptive reconnect
pub const PREEMPTIVE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-check period while elevated privilege is undecided
pub const PRIVILEGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Undecided privilege after this long counts as denied
pub const PRIVILEGE_WAIT: Duration = Duration::from_secs(30);

/// Bounds of the randomized delay between attempts
pub const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(1000);
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(2000);

/// Tunnel lifecycle owner
pub struct TunnelStateMachine {
    config: Arc<Config>,
    store: Arc<ServerEntryStore>,
    selector: Arc<ServerSelector>,
    transport: Arc<dyn RelayTransport>,
    relay: Arc<RelayHandle>,
    api: Arc<dyn ServerApi>,
    stats: Arc<StatsReporter>,
    fetcher: Option<Arc<RemoteListFetcher>>,
    platform: Platform,
    signals: Arc<SignalQueue>,
    events: Arc<dyn EventSink>,
    status: Arc<StatusLog>,
    last_connected: LastConnected,
    state: RwLock<TunnelState>,
    /// VPN or transparent routing is installed
    routing_up: AtomicBool,
}

impl TunnelStateMachine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ServerEntryStore>,
        selector: Arc<ServerSelector>,
        transport: Arc<dyn RelayTransport>,
        relay: Arc<RelayHandle>,
        api: Arc<dyn ServerApi>,
    ) -> Self {
        let stats = Arc::new(StatsReporter::new(&config.stats));
        TunnelStateMachine {
            config,
            store,
            selector,
            transport,
            relay,
            api,
            stats,
            fetcher: None,
            platform: Platform::default(),
            signals: Arc::new(SignalQueue::new()),
            events: Arc::new(NoopEventSink),
            status: Arc::new(StatusLog::new()),
            last_connected: LastConnected::in_memory(),
            state: RwLock::new(TunnelState::Disconnected),
            routing_up: AtomicBool::new(false),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<RemoteListFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_status_log(mut self, status: Arc<StatusLog>) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_connected(mut self, last_connected: LastConnected) -> Self {
        self.last_connected = last_connected;
        self
    }

    pub fn with_signals(mut self, signals: Arc<SignalQueue>) -> Self {
        self.signals = signals;
        self
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn signals(&self) -> &Arc<SignalQueue> {
        &self.signals
    }

    pub fn status(&self) -> &Arc<StatusLog> {
        &self.status
    }

    pub fn stats(&self) -> &Arc<StatsReporter> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<ServerEntryStore> {
        &self.store
    }

    /// Request a clean shutdown
    pub fn stop(&self) {
        self.signals.offer(Signal::Stop);
    }

    /// Run attempts until stopped or a fatal error occurs.
    ///
    /// Returns `Ok` after a requested stop.
    pub async fn run(&self) -> TunnelResult<()> {
        if !self.store.has_usable_entry(&self.config.egress_region) {
            self.status.error("No servers available");
            return Err(TunnelError::NoServersAvailable);
        }

        self.events.on_tunnel_starting();
        let stop = self.signals.stop_token();

        let result = loop {
            match self.run_once().await {
                Ok(()) | Err(TunnelError::StopRequested) => break Ok(()),
                Err(e) if e.is_fatal() => {
                    self.status.error(e.to_string());
                    break Err(e);
                }
                Err(e) => {
                    if e == TunnelError::UnexpectedDisconnect {
                        self.events.on_unexpected_disconnect();
                    }
                    self.status.warning(format!("Tunnel attempt failed: {}", e));
                }
            }

            if self.signals.stop_requested() {
                break Ok(());
            }
            self.refresh_server_list(&stop).await;

            let delay = retry_backoff();
            debug!("Retrying in {}ms", delay.as_millis());
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.cancelled() => break Ok(()),
            }
        };

        self.release_routing().await;
        self.set_state(TunnelState::Disconnected);
        self.events.on_tunnel_stopping();
        result
    }

    /// One attempt: connect, serve, tear down
    pub async fn run_once(&self) -> TunnelResult<()> {
        // A disconnect of the previous session's relay is stale by now
        if self.signals.pending() == Some(Signal::UnexpectedDisconnect) {
            self.signals.try_take();
        }

        let mut session = SessionContext::new();
        self.set_state(TunnelState::Connecting);
        self.stats.reset();

        let result = self.establish(&mut session).await;

        if let Err(e) = &result {
            if e.marks_server_failed() {
                if let Some(entry) = &session.entry {
                    self.status
                        .warning(format!("Server {} failed: {}", entry.ip_address, e));
                    self.store.mark_current_failed();
                }
            }
        }

        let will_retry = matches!(&result, Err(e) if e.should_retry())
            && !self.signals.stop_requested();
        self.teardown(&mut session, will_retry).await;
        result
    }

    async fn establish(&self, session: &mut SessionContext) -> TunnelResult<()> {
        let stop = self.signals.stop_token();

        if self.config.tunnel_whole_device && self.platform.vpn.is_none() {
            self.check_privilege(&stop).await?;
        }
        self.check_stop()?;

        self.status.info("Selecting server");
        let selection = self.selector.select(&stop).await;
        self.check_stop()?;
        let Some(winner) = selection.winner else {
            if !self.store.has_usable_entry(&self.config.egress_region) {
                return Err(TunnelError::NoServersAvailable);
            }
            return Err(TunnelError::TransportBroken(
                "no server responded".to_string(),
            ));
        };

        if self
            .store
            .set_current_server_entry_for(&winner.entry.ip_address)
            .is_none()
        {
            return Err(TunnelError::TransportBroken(format!(
                "server {} was replaced during selection",
                winner.entry.ip_address
            )));
        }
        let entry = winner.entry;
        session.entry = Some(entry.clone());
        session.relay_protocol = winner.connection.relay_protocol.to_string();
        self.status.info(format!(
            "Connecting to {} via {}",
            entry.ip_address, session.relay_protocol
        ));

        let connection = self
            .authenticate(&entry, winner.connection, &session.client_session_id, &stop)
            .await?;
        self.relay.swap(connection.clone());

        self.start_listeners(session).await?;
        self.monitor_disconnect(&connection);

        self.set_state(TunnelState::Connected);
        self.handshake(session, &stop).await?;
        self.maintain(session).await
    }

    async fn authenticate(
        &self,
        entry: &ServerEntry,
        connection: ProbeConnection,
        client_session_id: &str,
        stop: &CancellationToken,
    ) -> TunnelResult<Arc<dyn RelayConnection>> {
        let credentials = RelayCredentials::for_session(entry, client_session_id)
            .map_err(|e| TunnelError::AuthenticationFailed(e.to_string()))?;
        let endpoint = RelayEndpoint {
            host: connection.host,
            port: connection.port,
        };

        let auth = timeout(
            SESSION_ESTABLISHMENT_TIMEOUT,
            self.transport
                .authenticate(connection.stream, endpoint, credentials),
        );
        tokio::select! {
            outcome = auth => match outcome {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(e)) => Err(TunnelError::AuthenticationFailed(e.to_string())),
                Err(_) => Err(TunnelError::AuthenticationFailed(
                    "relay session establishment timed out".to_string(),
                )),
            },
            _ = stop.cancelled() => Err(TunnelError::StopRequested),
        }
    }

    async fn start_listeners(&self, session: &mut SessionContext) -> TunnelResult<()> {
        let socks: Arc<dyn LocalProxyListener> =
            Arc::new(Socks5ProxyListener::new(self.relay.clone(), self.stats.clone()));
        let socks_port = self
            .start_listener(session, socks, self.config.local_socks_port)
            .await?;

        let http: Arc<dyn LocalProxyListener> =
            Arc::new(HttpProxyListener::new(self.relay.clone(), self.stats.clone()));
        self.start_listener(session, http, self.config.local_http_port)
            .await?;

        if !self.config.tunnel_whole_device {
            return Ok(());
        }

        let remote_dns: SocketAddr = self.config.remote_dns.parse().map_err(|_| {
            TunnelError::TransportBroken(format!("invalid remote DNS {}", self.config.remote_dns))
        })?;
        let dns: Arc<dyn LocalProxyListener> = Arc::new(DnsProxyListener::new(
            self.relay.clone(),
            self.stats.clone(),
            remote_dns,
        ));
        let dns_port = self
            .start_listener(session, dns, self.config.local_dns_port)
            .await?;

        if let Some(vpn) = &self.platform.vpn {
            if !vpn.is_established() {
                vpn.establish(socks_port, dns_port).await.map_err(|e| {
                    TunnelError::TransportBroken(format!("{} VPN: {}", vpn.name(), e))
                })?;
                self.status.info(format!("{} VPN established", vpn.name()));
            }
        } else {
            let transparent: Arc<dyn LocalProxyListener> = Arc::new(
                TransparentProxyListener::new(self.relay.clone(), self.stats.clone()),
            );
            let transparent_port = self
                .start_listener(session, transparent, self.config.transparent_proxy_port)
                .await?;
            if !self.platform.routing.is_active() {
                self.platform
                    .routing
                    .start(transparent_port, dns_port)
                    .await
                    .map_err(|e| {
                        TunnelError::TransportBroken(format!("transparent routing: {}", e))
                    })?;
            }
        }
        self.routing_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_listener(
        &self,
        session: &mut SessionContext,
        listener: Arc<dyn LocalProxyListener>,
        preferred_port: u16,
    ) -> TunnelResult<u16> {
        session.listeners.push(listener.clone());
        let port = listener.start(preferred_port).await.map_err(|e| {
            TunnelError::TransportBroken(format!("{} listener: {}", listener.name(), e))
        })?;
        self.status.info(format!(
            "{} proxy is running on 127.0.0.1:{}",
            listener.name(),
            port
        ));
        Ok(port)
    }

    fn monitor_disconnect(&self, connection: &Arc<dyn RelayConnection>) {
        let signals = self.signals.clone();
        connection.on_disconnect(Box::new(move || {
            signals.offer(Signal::UnexpectedDisconnect);
        }));
    }

    async fn handshake(
        &self,
        session: &mut SessionContext,
        stop: &CancellationToken,
    ) -> TunnelResult<()> {
        let params = session
            .request_params(&self.config.client, self.config.tunnel_whole_device)
            .ok_or_else(|| TunnelError::HandshakeFailed("no server selected".to_string()))?;
        let known_servers: Vec<String> = self
            .store
            .entries()
            .into_iter()
            .map(|e| e.ip_address)
            .collect();

        let response = tokio::select! {
            response = self.api.handshake(&params, &known_servers) => {
                response.map_err(|e| TunnelError::HandshakeFailed(e.to_string()))?
            }
            _ = stop.cancelled() => return Err(TunnelError::StopRequested),
        };

        self.stats
            .set_regexes(&response.page_view_regexes, &response.https_request_regexes);
        if !response.encoded_server_list.is_empty() {
            self.store
                .merge_discovered(&response.encoded_server_list, false);
        }
        if let Some(version) = &response.upgrade_client_version {
            self.status
                .info(format!("Client upgrade available: {}", version));
        }
        for page in &response.homepages {
            debug!("Home page: {}", page);
        }

        if self.config.preemptive_reconnect {
            if let Some(lifetime) = response.preemptive_reconnect_lifetime() {
                let period = preemptive_period(lifetime);
                info!("Preemptive reconnect every {:?}", period);
                session.preemptive_period = Some(period);
                session.preemptive_at = Some(Instant::now() + period);
            }
        }

        let server_session_id = response.ssh_session_id.clone();
        session.server_session_id = Some(server_session_id.clone());
        self.events.on_handshake_success(&response);
        session.handshake = Some(response);
        self.status.info("Tunnel connected");

        let last_connected = self.last_connected.get();
        let connected = tokio::select! {
            connected = self.api.connected(&params, &server_session_id, &last_connected) => connected,
            _ = stop.cancelled() => return Err(TunnelError::StopRequested),
        };
        match connected {
            Ok(timestamp) => self.last_connected.set(&timestamp),
            Err(e) => warn!("Connected request failed: {}", e),
        }
        Ok(())
    }

    fn status_uploader(&self, session: &SessionContext) -> Option<SessionStatusUploader> {
        let params =
            session.request_params(&self.config.client, self.config.tunnel_whole_device)?;
        let server_session_id = session.server_session_id.clone()?;
        Some(SessionStatusUploader::new(
            self.api.clone(),
            params,
            server_session_id,
        ))
    }

    async fn maintain(&self, session: &mut SessionContext) -> TunnelResult<()> {
        let uploader = self.status_uploader(session);
        loop {
            match self.signals.poll(MAINTENANCE_POLL_INTERVAL).await {
                Some(Signal::Stop) => return Ok(()),
                Some(Signal::UnexpectedDisconnect) => {
                    self.status.warning("Tunnel disconnected unexpectedly");
                    return Err(TunnelError::UnexpectedDisconnect);
                }
                None => {}
            }

            if let Some(uploader) = &uploader {
                self.stats
                    .flush_if_due(uploader, Instant::now(), false)
                    .await;
            }

            if matches!(session.preemptive_at, Some(at) if Instant::now() >= at) {
                self.preemptive_reconnect(session).await?;
            }
        }
    }

    /// Open a second relay connection to the same server, move the
    /// listeners over to it and keep the old one for its open channels.
    async fn preemptive_reconnect(&self, session: &mut SessionContext) -> TunnelResult<()> {
        let (Some(entry), Some(period), Some(due)) = (
            session.entry.clone(),
            session.preemptive_period,
            session.preemptive_at,
        ) else {
            return Ok(());
        };
        let give_up_at = due + period;
        let stop = self.signals.stop_token();

        if let Some(retired) = session.retired.take() {
            retired.close().await;
            debug!("Retired relay connection closed");
        }
        self.check_stop()?;

        let probe = self
            .selector
            .prober()
            .probe(&entry, PREEMPTIVE_CONNECT_TIMEOUT);
        let probe = tokio::select! {
            probe = timeout(PREEMPTIVE_CONNECT_TIMEOUT, probe) => probe,
            _ = stop.cancelled() => return Err(TunnelError::StopRequested),
        };
        let connection = match probe {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return self.preemptive_failure(give_up_at, format!("connection failed: {}", e))
            }
            Err(_) => {
                return self.preemptive_failure(give_up_at, "connection timed out".to_string())
            }
        };

        let next_due = Instant::now() + period;
        let fresh = match self
            .authenticate(&entry, connection, &session.client_session_id, &stop)
            .await
        {
            Ok(fresh) => fresh,
            Err(TunnelError::StopRequested) => return Err(TunnelError::StopRequested),
            Err(e) => return self.preemptive_failure(give_up_at, e.to_string()),
        };
        session.preemptive_at = Some(next_due);
        self.monitor_disconnect(&fresh);

        let previous = self.relay.swap(fresh);
        session.retired = previous;
        for listener in &session.listeners {
            self.check_stop()?;
            match listener.rebind(next_due, &stop).await {
                Ok(port) => debug!("{} listener rebound on port {}", listener.name(), port),
                Err(e) => self
                    .status
                    .warning(format!("{} listener rebind failed: {}", listener.name(), e)),
            }
        }
        self.check_stop()?;
        info!("Preemptive reconnect to {} complete", entry.ip_address);
        Ok(())
    }

    /// Failures are retried on the next maintenance tick until a full
    /// period past the due time
    fn preemptive_failure(&self, give_up_at: Instant, reason: String) -> TunnelResult<()> {
        if Instant::now() > give_up_at {
            return Err(TunnelError::TransportBroken(format!(
                "preemptive reconnect: {}",
                reason
            )));
        }
        warn!("Preemptive reconnect failed, will retry: {}", reason);
        Ok(())
    }

    async fn teardown(&self, session: &mut SessionContext, will_retry: bool) {
        if session.handshake.is_some() {
            if let Some(uploader) = self.status_uploader(session) {
                self.stats
                    .flush_if_due(&uploader, Instant::now(), true)
                    .await;
            }
        }

        inbound::stop_all(&session.listeners).await;
        session.listeners.clear();

        if let Some(connection) = self.relay.clear() {
            connection.close().await;
        }
        if let Some(retired) = session.retired.take() {
            retired.close().await;
        }

        if !will_retry {
            self.release_routing().await;
            self.set_state(TunnelState::Disconnected);
        }
        debug!("Session teardown complete (retry: {})", will_retry);
    }

    async fn release_routing(&self) {
        if !self.routing_up.swap(false, Ordering::SeqCst) {
            return;
        }
        let result = match &self.platform.vpn {
            Some(vpn) => vpn.teardown().await,
            None => self.platform.routing.stop().await,
        };
        if let Err(e) = result {
            warn!("Failed to release device routing: {}", e);
        }
    }

    async fn check_privilege(&self, stop: &CancellationToken) -> TunnelResult<()> {
        let deadline = Instant::now() + PRIVILEGE_WAIT;
        loop {
            match self.platform.privilege.check() {
                PrivilegeStatus::Granted => return Ok(()),
                PrivilegeStatus::Denied => {
                    self.status
                        .error("Whole-device mode requires elevated privileges");
                    return Err(TunnelError::PrivilegeDenied);
                }
                PrivilegeStatus::Unknown => {}
            }
            if Instant::now() >= deadline {
                self.status.error("Timed out waiting for elevated privileges");
                return Err(TunnelError::PrivilegeDenied);
            }
            tokio::select! {
                _ = sleep(PRIVILEGE_POLL_INTERVAL) => {}
                _ = stop.cancelled() => return Err(TunnelError::StopRequested),
            }
        }
    }

    async fn refresh_server_list(&self, stop: &CancellationToken) {
        let Some(fetcher) = &self.fetcher else {
            return;
        };
        match fetcher.fetch_if_due(Instant::now(), stop).await {
            Ok(merged) => info!(
                "Remote server list merged: {} new, {} updated",
                merged.inserted, merged.replaced
            ),
            Err(FetchError::NotDue) | Err(FetchError::Stopped) => {}
            Err(e) => warn!("Remote server list fetch failed: {}", e),
        }
    }

    fn check_stop(&self) -> TunnelResult<()> {
        if self.signals.stop_requested() {
            Err(TunnelError::StopRequested)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: TunnelState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Tunnel state {} -> {}", previous, state);
            self.events.on_state_changed(state);
        }
    }
}

fn retry_backoff() -> Duration {
    let min = RETRY_BACKOFF_MIN.as_millis() as u64;
    let max = RETRY_BACKOFF_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HandshakeResponse, RequestParams};
    use crate::common::dialer::DialError;
    use crate::common::net::BoxedStream;
    use crate::platform::PrivilegeChecker;
    use crate::relay::tests::PipeRelay;
    use crate::selector::Prober;
    use crate::server::entry_fixtures::encoded;
    use crate::statistic::StatusPayload;
    use crate::Error;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const PREFERRED: &str = "10.0.0.1";

    /// Answers at once for the preferred server, slowly for the rest
    struct InstantProber;

    #[async_trait]
    impl Prober for InstantProber {
        async fn probe(
            &self,
            entry: &ServerEntry,
            _connect_timeout: Duration,
        ) -> std::result::Result<ProbeConnection, DialError> {
            if entry.ip_address != PREFERRED {
                sleep(Duration::from_secs(5)).await;
            }
            let (stream, _peer) = tokio::io::duplex(64);
            Ok(ProbeConnection {
                stream: Box::new(stream),
                host: entry.ip_address.clone(),
                port: entry.ssh_obfuscated_port.unwrap_or(443),
                relay_protocol: "OSSH",
            })
        }
    }

    /// Answers every server at once; fails every call from `fail_from` on
    #[derive(Default)]
    struct EagerProber {
        calls: AtomicUsize,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl Prober for EagerProber {
        async fn probe(
            &self,
            entry: &ServerEntry,
            _connect_timeout: Duration,
        ) -> std::result::Result<ProbeConnection, DialError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if matches!(self.fail_from, Some(from) if call >= from) {
                return Err(DialError::Target(Error::connection("refused")));
            }
            let (stream, _peer) = tokio::io::duplex(64);
            Ok(ProbeConnection {
                stream: Box::new(stream),
                host: entry.ip_address.clone(),
                port: entry.ssh_obfuscated_port.unwrap_or(443),
                relay_protocol: "OSSH",
            })
        }
    }

    #[derive(Default)]
    struct PipeTransport {
        reject: bool,
        hosts: Mutex<Vec<String>>,
        relays: Mutex<Vec<Arc<PipeRelay>>>,
    }

    #[async_trait]
    impl RelayTransport for PipeTransport {
        async fn authenticate(
            &self,
            _stream: BoxedStream,
            endpoint: RelayEndpoint,
            _credentials: RelayCredentials,
        ) -> crate::Result<Arc<dyn RelayConnection>> {
            self.hosts.lock().push(endpoint.host);
            if self.reject {
                return Err(Error::auth("permission denied"));
            }
            let relay = Arc::new(PipeRelay::default());
            self.relays.lock().push(relay.clone());
            Ok(relay)
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        fail_handshake: bool,
        preemptive_lifetime_ms: Option<u64>,
        handshakes: AtomicUsize,
        last_connected_sent: Mutex<Vec<String>>,
        final_status: AtomicUsize,
    }

    #[async_trait]
    impl ServerApi for RecordingApi {
        async fn handshake(
            &self,
            _params: &RequestParams,
            _known_servers: &[String],
        ) -> crate::Result<HandshakeResponse> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            if self.fail_handshake {
                return Err(Error::protocol("bad handshake"));
            }
            Ok(HandshakeResponse {
                ssh_session_id: "server-session".into(),
                preemptive_reconnect_lifetime_milliseconds: self.preemptive_lifetime_ms,
                ..Default::default()
            })
        }

        async fn connected(
            &self,
            _params: &RequestParams,
            server_session_id: &str,
            last_connected: &str,
        ) -> crate::Result<String> {
            assert_eq!(server_session_id, "server-session");
            self.last_connected_sent
                .lock()
                .push(last_connected.to_string());
            Ok("2026-01-01T00:00:00Z".into())
        }

        async fn status(
            &self,
            _params: &RequestParams,
            _server_session_id: &str,
            _payload: &StatusPayload,
            is_final: bool,
        ) -> crate::Result<()> {
            if is_final {
                self.final_status.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        states: Mutex<Vec<TunnelState>>,
        disconnects: AtomicUsize,
        stopping: AtomicUsize,
    }

    impl EventSink for RecordingEvents {
        fn on_state_changed(&self, state: TunnelState) {
            self.states.lock().push(state);
        }

        fn on_unexpected_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_tunnel_stopping(&self) {
            self.stopping.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Denied;

    impl PrivilegeChecker for Denied {
        fn check(&self) -> PrivilegeStatus {
            PrivilegeStatus::Denied
        }
    }

    fn test_config() -> Config {
        Config {
            local_socks_port: 0,
            local_http_port: 0,
            local_dns_port: 0,
            transparent_proxy_port: 0,
            ..Default::default()
        }
    }

    fn machine(
        config: Config,
        ips: &[&str],
        transport: Arc<PipeTransport>,
        api: Arc<RecordingApi>,
    ) -> TunnelStateMachine {
        machine_with_prober(config, ips, Arc::new(InstantProber), transport, api)
    }

    fn machine_with_prober(
        config: Config,
        ips: &[&str],
        prober: Arc<dyn Prober>,
        transport: Arc<PipeTransport>,
        api: Arc<RecordingApi>,
    ) -> TunnelStateMachine {
        let store = Arc::new(ServerEntryStore::in_memory());
        let raw: Vec<String> = ips.iter().map(|ip| encoded(ip)).collect();
        store.merge_embedded(&raw, false);
        let selector = Arc::new(ServerSelector::new(
            store.clone(),
            prober,
            config.selector.clone(),
            "",
        ));
        TunnelStateMachine::new(
            Arc::new(config),
            store,
            selector,
            transport,
            Arc::new(RelayHandle::new()),
            api,
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(10), async {
            while !condition() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_run_without_servers_is_fatal() {
        let machine = machine(
            test_config(),
            &[],
            Arc::new(PipeTransport::default()),
            Arc::new(RecordingApi::default()),
        );
        assert_eq!(machine.run().await, Err(TunnelError::NoServersAvailable));
        assert_eq!(machine.state(), TunnelState::Disconnected);
    }

    #[tokio::test]
    async fn test_privilege_denied_is_fatal() {
        let config = Config {
            tunnel_whole_device: true,
            ..test_config()
        };
        let platform = Platform {
            privilege: Arc::new(Denied),
            ..Platform::default()
        };
        let transport = Arc::new(PipeTransport::default());
        let machine = machine(
            config,
            &["10.0.0.1"],
            transport.clone(),
            Arc::new(RecordingApi::default()),
        )
        .with_platform(platform);

        assert_eq!(machine.run().await, Err(TunnelError::PrivilegeDenied));
        assert!(transport.relays.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connect_then_stop() {
        let transport = Arc::new(PipeTransport::default());
        let api = Arc::new(RecordingApi::default());
        let events = Arc::new(RecordingEvents::default());
        let machine = Arc::new(
            machine(test_config(), &["10.0.0.1"], transport.clone(), api.clone())
                .with_events(events.clone()),
        );

        let runner = tokio::spawn({
            let machine = machine.clone();
            async move { machine.run().await }
        });
        wait_for(|| !api.last_connected_sent.lock().is_empty()).await;
        assert_eq!(machine.state(), TunnelState::Connected);
        assert_eq!(api.last_connected_sent.lock()[0], "None");

        machine.stop();
        assert_eq!(runner.await.unwrap(), Ok(()));

        assert_eq!(machine.state(), TunnelState::Disconnected);
        assert_eq!(api.final_status.load(Ordering::SeqCst), 1);
        assert!(transport.relays.lock()[0].is_closed());
        assert_eq!(events.stopping.load(Ordering::SeqCst), 1);
        assert_eq!(
            *events.states.lock(),
            vec![
                TunnelState::Connecting,
                TunnelState::Connected,
                TunnelState::Disconnected
            ]
        );
        assert_eq!(machine.last_connected.get(), "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_reconnects_same_server() {
        let transport = Arc::new(PipeTransport::default());
        let api = Arc::new(RecordingApi::default());
        let events = Arc::new(RecordingEvents::default());
        let machine = Arc::new(
            machine(
                test_config(),
                &["10.0.0.1", "10.0.0.2"],
                transport.clone(),
                api.clone(),
            )
            .with_events(events.clone()),
        );

        let runner = tokio::spawn({
            let machine = machine.clone();
            async move { machine.run().await }
        });
        wait_for(|| api.handshakes.load(Ordering::SeqCst) == 1).await;
        let first = transport.relays.lock()[0].clone();
        first.disconnect();

        wait_for(|| api.handshakes.load(Ordering::SeqCst) == 2).await;
        assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.relays.lock().len(), 2);
        assert!(machine.status().history().iter().any(|e| e.severity == Severity::Warning));

        machine.stop();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_handshake_failure_moves_server_to_tail() {
        let transport = Arc::new(PipeTransport::default());
        let api = Arc::new(RecordingApi {
            fail_handshake: true,
            ..Default::default()
        });
        let machine = machine(
            test_config(),
            &["10.0.0.1", "10.0.0.2"],
            transport.clone(),
            api,
        );
        assert_eq!(machine.store().entries()[0].ip_address, PREFERRED);

        let result = machine.run_once().await;
        assert!(matches!(result, Err(TunnelError::HandshakeFailed(_))));

        let order: Vec<String> = machine
            .store()
            .entries()
            .into_iter()
            .map(|e| e.ip_address)
            .collect();
        assert_eq!(order, vec!["10.0.0.2".to_string(), PREFERRED.to_string()]);
        assert!(transport.relays.lock()[0].is_closed());
        // Teardown keeps the state for the retry
        assert_eq!(machine.state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_rejected_server_yields_to_other_responder() {
        let transport = Arc::new(PipeTransport {
            reject: true,
            ..Default::default()
        });
        let machine = machine_with_prober(
            test_config(),
            &["10.0.0.1", "10.0.0.2"],
            Arc::new(EagerProber::default()),
            transport.clone(),
            Arc::new(RecordingApi::default()),
        );

        for _ in 0..4 {
            let result = machine.run_once().await;
            assert!(matches!(result, Err(TunnelError::AuthenticationFailed(_))));
        }
        assert_eq!(
            *transport.hosts.lock(),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]
        );
    }

    fn listener_ports(machine: &TunnelStateMachine) -> Vec<u16> {
        machine
            .status()
            .history()
            .iter()
            .filter_map(|e| e.message.split_once("proxy is running on 127.0.0.1:"))
            .filter_map(|(_, port)| port.parse().ok())
            .collect()
    }

    #[tokio::test]
    async fn test_preemptive_reconnect_rotates_relay() {
        let transport = Arc::new(PipeTransport::default());
        // A 300ms period, so every maintenance tick reconnects
        let api = Arc::new(RecordingApi {
            preemptive_lifetime_ms: Some(10_600),
            ..Default::default()
        });
        let machine = Arc::new(machine_with_prober(
            test_config(),
            &["10.0.0.1"],
            Arc::new(EagerProber::default()),
            transport.clone(),
            api.clone(),
        ));

        let runner = tokio::spawn({
            let machine = machine.clone();
            async move { machine.run().await }
        });
        wait_for(|| transport.relays.lock().len() >= 3).await;
        // Let the rebind that follows the third login finish
        sleep(Duration::from_millis(300)).await;

        assert_eq!(api.handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(machine.state(), TunnelState::Connected);
        {
            let relays = transport.relays.lock();
            // Retired by the first rotation, closed by the second
            assert!(relays[0].is_closed());
            assert!(!relays[relays.len() - 1].is_closed());
        }
        assert!(transport.hosts.lock().iter().all(|h| h == "10.0.0.1"));

        let ports = listener_ports(&machine);
        assert_eq!(ports.len(), 2);
        for port in ports {
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
        }
        assert!(!machine
            .status()
            .history()
            .iter()
            .any(|e| e.message.contains("rebind failed")));

        machine.stop();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_preemptive_failure_retries_until_window_closes() {
        let transport = Arc::new(PipeTransport::default());
        // A 2s period: due 2s after the handshake, abandoned 2s later
        let api = Arc::new(RecordingApi {
            preemptive_lifetime_ms: Some(14_000),
            ..Default::default()
        });
        let prober = Arc::new(EagerProber {
            fail_from: Some(1),
            ..Default::default()
        });
        let machine = machine_with_prober(
            test_config(),
            &["10.0.0.1"],
            prober.clone(),
            transport.clone(),
            api,
        );

        let start = Instant::now();
        let result = timeout(Duration::from_secs(15), machine.run_once())
            .await
            .unwrap();
        match result {
            Err(TunnelError::TransportBroken(reason)) => {
                assert!(reason.contains("preemptive"), "{}", reason)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(4));
        // The selection probe plus at least two failed reconnects
        assert!(prober.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(transport.relays.lock().len(), 1);
        assert!(transport.relays.lock()[0].is_closed());
    }

    #[test]
    fn test_retry_backoff_bounds() {
        for _ in 0..50 {
            let delay = retry_backoff();
            assert!(delay >= RETRY_BACKOFF_MIN && delay <= RETRY_BACKOFF_MAX);
        }
    }
}
