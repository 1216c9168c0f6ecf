//! DNS proxy inbound
//!
//! Accepts UDP queries on loopback and resolves each one over TCP through
//! a fresh relay channel to the remote resolver.

use super::{LocalProxyListener, REBIND_RETRY_INTERVAL};
use crate::common::net::PORT_SCAN_RANGE;
use crate::relay::RelayHandle;
use crate::statistic::{StatsReporter, TrackedStream};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MAX_PACKET_SIZE: usize = 1500;
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

struct ServeTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// DNS proxy listener
pub struct DnsProxyListener {
    relay: Arc<RelayHandle>,
    stats: Arc<StatsReporter>,
    remote: SocketAddr,
    running: AtomicBool,
    port: AtomicU16,
    task: Mutex<Option<ServeTask>>,
}

impl DnsProxyListener {
    pub fn new(relay: Arc<RelayHandle>, stats: Arc<StatsReporter>, remote: SocketAddr) -> Self {
        DnsProxyListener {
            relay,
            stats,
            remote,
            running: AtomicBool::new(false),
            port: AtomicU16::new(0),
            task: Mutex::new(None),
        }
    }

    fn serve(&self, socket: UdpSocket) -> Result<u16> {
        let addr = socket.local_addr()?;
        info!("DNS proxy listening on {} (upstream {})", addr, self.remote);

        let socket = Arc::new(socket);
        let relay = self.relay.clone();
        let stats = self.stats.clone();
        let remote = self.remote;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, client)) => {
                            let query = buf[..n].to_vec();
                            let socket = socket.clone();
                            let relay = relay.clone();
                            let stats = stats.clone();
                            tokio::spawn(async move {
                                match timeout(QUERY_TIMEOUT, resolve(&relay, stats, remote, &query)).await {
                                    Ok(Ok(answer)) => {
                                        if let Err(e) = socket.send_to(&answer, client).await {
                                            debug!("DNS reply to {} failed: {}", client, e);
                                        }
                                    }
                                    Ok(Err(e)) => debug!("DNS query from {} failed: {}", client, e),
                                    Err(_) => debug!("DNS query from {} timed out", client),
                                }
                            });
                        }
                        Err(e) => error!("DNS receive error: {}", e),
                    },
                    _ = token.cancelled() => break,
                }
            }
            debug!("DNS receive loop finished");
        });

        *self.task.lock() = Some(ServeTask { shutdown, handle });
        self.port.store(addr.port(), Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(addr.port())
    }

    async fn shutdown(&self) {
        let task = self.task.lock().take();
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = task {
            task.shutdown.cancel();
            let _ = task.handle.await;
            debug!("DNS listener stopped");
        }
    }
}

/// Send one query as DNS-over-TCP and return the answer
async fn resolve(
    relay: &RelayHandle,
    stats: Arc<StatsReporter>,
    remote: SocketAddr,
    query: &[u8],
) -> Result<Vec<u8>> {
    let channel = relay
        .open_channel(&remote.ip().to_string(), remote.port())
        .await?;
    let mut channel = TrackedStream::new(channel, stats);

    let len = u16::try_from(query.len()).map_err(|_| Error::protocol("DNS query too large"))?;
    let mut framed = BytesMut::with_capacity(query.len() + 2);
    framed.put_u16(len);
    framed.put_slice(query);
    channel.write_all(&framed).await?;

    let answer_len = channel.read_u16().await? as usize;
    let mut answer = vec![0u8; answer_len];
    channel.read_exact(&mut answer).await?;
    Ok(answer)
}

async fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}

#[async_trait]
impl LocalProxyListener for DnsProxyListener {
    fn name(&self) -> &str {
        "DNS"
    }

    async fn start(&self, preferred_port: u16) -> Result<u16> {
        if self.is_running() {
            return Err(Error::internal("DNS listener already running"));
        }
        let mut last_error = None;
        for offset in 0..PORT_SCAN_RANGE {
            let Some(port) = preferred_port.checked_add(offset) else {
                break;
            };
            match bind_udp(port).await {
                Ok(socket) => return self.serve(socket),
                Err(e) => {
                    debug!("Local DNS port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(Error::config(format!(
            "no available local DNS port from {}: {}",
            preferred_port,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "port range exhausted".to_string())
        )))
    }

    async fn rebind(&self, deadline: Instant, cancel: &CancellationToken) -> Result<u16> {
        let port = self
            .port()
            .ok_or_else(|| Error::internal("DNS listener was never started"))?;
        self.shutdown().await;
        loop {
            match bind_udp(port).await {
                Ok(socket) => return self.serve(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && Instant::now() < deadline => {
                    tokio::select! {
                        _ = sleep(REBIND_RETRY_INTERVAL) => {}
                        _ = cancel.cancelled() => {
                            return Err(Error::connection(format!(
                                "bind of port {} cancelled",
                                port
                            )));
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }
}
