//! SOCKS5 proxy inbound (no auth, CONNECT only)

use super::{ListenerSlot, LocalProxyListener};
use crate::common::net::{configure_tcp_stream, copy_bidirectional_owned, Address};
use crate::common::socks::{
    AuthMethodFlags, AuthResponse, Command, Request, Response, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
};
use crate::relay::RelayHandle;
use crate::statistic::{StatsReporter, TrackedStream};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// SOCKS5 proxy listener
pub struct Socks5ProxyListener {
    relay: Arc<RelayHandle>,
    stats: Arc<StatsReporter>,
    slot: ListenerSlot,
}

impl Socks5ProxyListener {
    pub fn new(relay: Arc<RelayHandle>, stats: Arc<StatsReporter>) -> Self {
        Socks5ProxyListener {
            relay,
            stats,
            slot: ListenerSlot::new("SOCKS5"),
        }
    }

    fn handler(
        &self,
    ) -> impl Fn(TcpStream, SocketAddr) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static
    {
        let relay = self.relay.clone();
        let stats = self.stats.clone();
        move |stream, peer_addr| {
            let relay = relay.clone();
            let stats = stats.clone();
            Box::pin(async move {
                configure_tcp_stream(&stream);
                if let Err(e) = process_connection(&relay, stats, stream, peer_addr).await {
                    debug!("SOCKS5 connection error from {}: {}", peer_addr, e);
                }
            })
        }
    }
}

async fn process_connection(
    relay: &RelayHandle,
    stats: Arc<StatsReporter>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let auth_methods = AuthMethodFlags::read_from(&mut stream).await?;
    if !auth_methods.no_auth {
        AuthResponse::new(AUTH_NO_ACCEPTABLE)
            .write_to(&mut stream)
            .await?;
        return Err(Error::auth("No acceptable authentication method"));
    }
    AuthResponse::new(AUTH_NO_AUTH).write_to(&mut stream).await?;

    let request = Request::read_from(&mut stream).await?;
    if request.command != Command::Connect {
        Response::failure(REP_COMMAND_NOT_SUPPORTED)
            .write_to(&mut stream)
            .await?;
        return Err(Error::unsupported(format!(
            "SOCKS5 {:?} not supported",
            request.command
        )));
    }

    let host = request.address.to_host();
    let port = request.port;
    debug!("SOCKS5 CONNECT {} -> {}:{}", peer_addr, host, port);

    match relay.open_channel(&host, port).await {
        Ok(remote) => {
            let local_addr = stream
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            Response::success(Address::from(local_addr.ip()), local_addr.port())
                .write_to(&mut stream)
                .await?;

            let remote = TrackedStream::new(remote, stats);
            let (sent, received) = copy_bidirectional_owned(stream, remote).await?;
            debug!(
                "SOCKS5 CONNECT {} -> {}:{} completed (sent: {}, received: {})",
                peer_addr, host, port, sent, received
            );
            Ok(())
        }
        Err(e) => {
            Response::failure(REP_GENERAL_FAILURE)
                .write_to(&mut stream)
                .await?;
            Err(e)
        }
    }
}

#[async_trait]
impl LocalProxyListener for Socks5ProxyListener {
    fn name(&self) -> &str {
        "SOCKS5"
    }

    async fn start(&self, preferred_port: u16) -> Result<u16> {
        self.slot.start(preferred_port, self.handler()).await
    }

    async fn rebind(&self, deadline: Instant, cancel: &CancellationToken) -> Result<u16> {
        self.slot.rebind(deadline, cancel, self.handler()).await
    }

    async fn stop(&self) -> Result<()> {
        self.slot.stop().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    fn port(&self) -> Option<u16> {
        self.slot.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::socks::client_connect;
    use crate::config::StatsConfig;
    use crate::relay::tests::PipeRelay;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn no_auth_handshake(stream: &mut TcpStream) {
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_connect_through_relay() {
        let relay = Arc::new(PipeRelay::default());
        let handle = Arc::new(RelayHandle::with_connection(relay.clone()));
        let stats = Arc::new(StatsReporter::new(&StatsConfig::default()));
        let listener = Socks5ProxyListener::new(handle, stats.clone());
        let port = listener.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        no_auth_handshake(&mut client).await;
        client_connect(&mut client, "example.com", 80).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut peer = loop {
            if let Some(peer) = relay.peers.lock().pop() {
                break peer;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        peer.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(
            relay.opened.lock().as_slice(),
            &[("example.com".to_string(), 80)]
        );
        assert_eq!(stats.bytes_transferred(), 8);
        listener.stop().await.unwrap();
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_connect_fails_without_relay() {
        let handle = Arc::new(RelayHandle::new());
        let stats = Arc::new(StatsReporter::new(&StatsConfig::default()));
        let listener = Socks5ProxyListener::new(handle, stats);
        let port = listener.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        no_auth_handshake(&mut client).await;
        assert!(client_connect(&mut client, "example.com", 80).await.is_err());
        listener.stop().await.unwrap();
    }
}
