//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of consecutive ports tried when the preferred local port is taken
pub const PORT_SCAN_RANGE: u16 = 10;

/// Any bidirectional byte stream: TCP sockets, relay channels, test pipes
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Get bytes length
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,             // atyp + ip + port
            Address::Ipv6(_) => 1 + 16 + 2,            // atyp + ip + port
            Address::Domain(d) => 1 + 1 + d.len() + 2, // atyp + len + domain + port
        }
    }

    /// Convert to string representation
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }

    /// Get as domain string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host.to_string())
    }
}

/// Copy data between two streams bidirectionally (owned).
pub async fn copy_bidirectional_owned<A, B>(a: A, b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a = a;
    let mut b = b;
    Ok(tokio::io::copy_bidirectional(&mut a, &mut b).await?)
}

/// Open a TCP connection with a connect timeout
pub async fn connect_with_timeout(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    match timeout(limit, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => {
            configure_tcp_stream(&stream);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::connection(format!("connect {}: {}", target, e))),
        Err(_) => Err(Error::timeout(format!("connect {} timed out", target))),
    }
}

/// Bind a loopback listener on the preferred port or one of the next
/// `PORT_SCAN_RANGE - 1` ports.
pub async fn bind_available_port(preferred: u16) -> Result<TcpListener> {
    let mut last_error = None;
    for offset in 0..PORT_SCAN_RANGE {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("Local port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }
    Err(Error::config(format!(
        "no available local port in {}..{}: {}",
        preferred,
        preferred.saturating_add(PORT_SCAN_RANGE),
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "port range exhausted".to_string())
    )))
}

/// Bind exactly `port`, retrying every `retry_every` while the address is
/// still in use, until `deadline` or `cancel`.
pub async fn bind_with_retry(
    port: u16,
    retry_every: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && Instant::now() < deadline => {
                tokio::select! {
                    _ = sleep(retry_every) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::connection(format!("bind of port {} cancelled", port)));
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
