//! HTTP proxy inbound
//!
//! CONNECT requests become relay channels; absolute-URI requests are
//! forwarded with hop-by-hop headers removed. Requested pages and CONNECT
//! hosts are recorded for the status report.

use super::{ListenerSlot, LocalProxyListener};
use crate::common::net::{configure_tcp_stream, copy_bidirectional_owned};
use crate::relay::RelayHandle;
use crate::statistic::{StatsReporter, TrackedStream};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_HEADER_LINES: usize = 100;

/// HTTP proxy listener
pub struct HttpProxyListener {
    relay: Arc<RelayHandle>,
    stats: Arc<StatsReporter>,
    slot: ListenerSlot,
}

impl HttpProxyListener {
    pub fn new(relay: Arc<RelayHandle>, stats: Arc<StatsReporter>) -> Self {
        HttpProxyListener {
            relay,
            stats,
            slot: ListenerSlot::new("HTTP"),
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
                    debug!("HTTP connection error from {}: {}", peer_addr, e);
                }
            })
        }
    }
}

async fn process_connection(
    relay: &RelayHandle,
    stats: Arc<StatsReporter>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut first_line = String::new();
    reader.read_line(&mut first_line).await?;
    let first_line = first_line.trim();
    if first_line.is_empty() {
        return Err(Error::protocol("Empty request"));
    }

    // METHOD URI HTTP/VERSION
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::protocol("Invalid HTTP request line"));
    }
    let method = parts[0].to_string();
    let uri = parts[1].to_string();

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::protocol("Connection closed in headers"));
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(Error::protocol("Too many headers"));
        }
        if let Some(colon_idx) = line.find(':') {
            let key = line[..colon_idx].trim().to_string();
            let value = line[colon_idx + 1..].trim().to_string();
            headers.push((key, value));
        }
    }

    // Body bytes already read past the headers
    let buffered = reader.buffer().to_vec();
    let stream = reader.into_inner();

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(relay, stats, stream, &uri, peer_addr).await
    } else {
        handle_http(relay, stats, stream, &method, &uri, &headers, buffered, peer_addr).await
    }
}

async fn handle_connect(
    relay: &RelayHandle,
    stats: Arc<StatsReporter>,
    mut stream: TcpStream,
    uri: &str,
    peer_addr: SocketAddr,
) -> Result<()> {
    let (host, port) = parse_host_port(uri, 443)?;
    debug!("HTTP CONNECT {} -> {}:{}", peer_addr, host, port);
    stats.record_https_request(&host);

    match relay.open_channel(&host, port).await {
        Ok(remote) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            let remote = TrackedStream::new(remote, stats);
            let (sent, received) = copy_bidirectional_owned(stream, remote).await?;
            debug!(
                "CONNECT {} -> {}:{} completed (sent: {}, received: {})",
                peer_addr, host, port, sent, received
            );
            Ok(())
        }
        Err(e) => {
            write_bad_gateway(&mut stream, &e).await?;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_http(
    relay: &RelayHandle,
    stats: Arc<StatsReporter>,
    mut stream: TcpStream,
    method: &str,
    uri: &str,
    headers: &[(String, String)],
    buffered: Vec<u8>,
    peer_addr: SocketAddr,
) -> Result<()> {
    let Some(rest) = uri.strip_prefix("http://") else {
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
            .await?;
        return Err(Error::protocol(format!("Not an absolute http URI: {}", uri)));
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = parse_host_port(host_port, 80)?;
    debug!("HTTP {} {} {} -> {}:{}", peer_addr, method, path, host, port);
    stats.record_page_view(uri);

    match relay.open_channel(&host, port).await {
        Ok(remote) => {
            let mut remote = TrackedStream::new(remote, stats);

            let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, path, host_port);
            for (key, value) in headers {
                if !is_hop_by_hop_header(key) && !key.eq_ignore_ascii_case("host") {
                    request.push_str(&format!("{}: {}\r\n", key, value));
                }
            }
            request.push_str("Connection: close\r\n\r\n");
            remote.write_all(request.as_bytes()).await?;
            if !buffered.is_empty() {
                remote.write_all(&buffered).await?;
            }

            let (sent, received) = copy_bidirectional_owned(stream, remote).await?;
            debug!(
                "HTTP {} {}:{}{} completed (sent: {}, received: {})",
                method, host, port, path, sent, received
            );
            Ok(())
        }
        Err(e) => {
            write_bad_gateway(&mut stream, &e).await?;
            Err(e)
        }
    }
}

async fn write_bad_gateway(stream: &mut TcpStream, error: &Error) -> Result<()> {
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\r\n\
         Connection failed: {}",
        error
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[async_trait]
impl LocalProxyListener for HttpProxyListener {
    fn name(&self) -> &str {
        "HTTP"
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

/// Parse host:port, bracketed IPv6 included
fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::parse("Unterminated IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| Error::parse("Invalid port"))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| Error::parse("Invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Check if header is a hop-by-hop header
fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::relay::tests::PipeRelay;
    use crate::statistic::OTHER_ENTRY;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn next_peer(relay: &PipeRelay) -> tokio::io::DuplexStream {
        loop {
            if let Some(peer) = relay.peers.lock().pop() {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn setup() -> (Arc<PipeRelay>, Arc<StatsReporter>, HttpProxyListener) {
        let relay = Arc::new(PipeRelay::default());
        let handle = Arc::new(RelayHandle::with_connection(relay.clone()));
        let stats = Arc::new(StatsReporter::new(&StatsConfig::default()));
        let listener = HttpProxyListener::new(handle, stats.clone());
        (relay, stats, listener)
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:443", 80).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            parse_host_port("[::1]:8080", 80).unwrap(),
            ("::1".to_string(), 8080)
        );
        assert!(parse_host_port("example.com:x", 80).is_err());
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }

    #[tokio::test]
    async fn test_connect_method() {
        let (relay, stats, listener) = setup();
        let port = listener.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut reply = [0u8; 39];
        client.read_exact(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        let _peer = next_peer(&relay).await;
        assert_eq!(
            relay.opened.lock().as_slice(),
            &[("example.com".to_string(), 443)]
        );
        assert_eq!(stats.https_request_count(OTHER_ENTRY), 1);
        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_rewrites_request() {
        let (relay, stats, listener) = setup();
        let port = listener.start(0).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            )
            .await
            .unwrap();

        let mut peer = next_peer(&relay).await;
        let mut forwarded = Vec::new();
        let mut buf = [0u8; 256];
        while !forwarded.ends_with(b"\r\n\r\n") {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0);
            forwarded.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.starts_with("GET /index.html HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.contains("Proxy-Connection"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
        assert_eq!(stats.page_view_count(OTHER_ENTRY), 1);
        listener.stop().await.unwrap();
    }
}
