//! Outbound TCP dialing, direct or through an upstream HTTP proxy
//!
//! Implements the HTTP CONNECT method for reaching relay servers from behind
//! a configured proxy.

use super::net::{configure_tcp_stream, connect_with_timeout};
use crate::config::UpstreamProxyConfig;
use crate::Error;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const MAX_CONNECT_RESPONSE: usize = 4096;

/// Which leg of a dial failed
#[derive(Debug, ThisError)]
pub enum DialError {
    /// The target could not be reached
    #[error("{0}")]
    Target(Error),

    /// The upstream proxy is unreachable or refused the request
    #[error("upstream proxy: {0}")]
    UpstreamProxy(Error),
}

impl DialError {
    pub fn is_upstream_proxy(&self) -> bool {
        matches!(self, DialError::UpstreamProxy(_))
    }
}

impl From<DialError> for Error {
    fn from(e: DialError) -> Self {
        match e {
            DialError::Target(e) => e,
            DialError::UpstreamProxy(e) => Error::connection(format!("upstream proxy: {}", e)),
        }
    }
}

/// Opens TCP connections to relay servers
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    upstream: Option<UpstreamProxyConfig>,
}

impl Dialer {
    pub fn direct() -> Self {
        Dialer { upstream: None }
    }

    pub fn new(upstream: Option<UpstreamProxyConfig>) -> Self {
        Dialer { upstream }
    }

    pub fn upstream(&self) -> Option<&UpstreamProxyConfig> {
        self.upstream.as_ref()
    }

    /// Connect to `host:port`, bounded by `limit` overall
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        limit: Duration,
    ) -> std::result::Result<TcpStream, DialError> {
        let Some(proxy) = &self.upstream else {
            return connect_with_timeout(host, port, limit)
                .await
                .map_err(DialError::Target);
        };

        let mut stream = connect_with_timeout(&proxy.host, proxy.port, limit)
            .await
            .map_err(DialError::UpstreamProxy)?;
        configure_tcp_stream(&stream);

        match timeout(limit, http_connect(&mut stream, host, port)).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::Target(Error::timeout(format!(
                "CONNECT {}:{} via upstream proxy timed out",
                host, port
            )))),
        }
    }
}

/// Perform the HTTP CONNECT handshake on an open proxy connection
pub async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> std::result::Result<(), DialError> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    debug!("Sending CONNECT to {}:{}", host, port);

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DialError::UpstreamProxy(e.into()))?;
    stream
        .flush()
        .await
        .map_err(|e| DialError::UpstreamProxy(e.into()))?;

    // Read byte by byte so nothing past the header block is consumed
    let mut response = Vec::with_capacity(256);
    loop {
        let mut byte = [0u8; 1];
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| DialError::UpstreamProxy(e.into()))?;
        if n == 0 {
            return Err(DialError::UpstreamProxy(Error::connection(
                "connection closed during CONNECT",
            )));
        }
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        if response.len() >= MAX_CONNECT_RESPONSE {
            return Err(DialError::UpstreamProxy(Error::protocol(
                "CONNECT response too large",
            )));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);
    parsed
        .parse(&response)
        .map_err(|e| DialError::UpstreamProxy(Error::protocol(format!("bad CONNECT response: {}", e))))?;

    match parsed.code {
        Some(200..=299) => Ok(()),
        Some(407) => Err(DialError::UpstreamProxy(Error::auth(
            "proxy authentication required",
        ))),
        Some(code) if code >= 500 => Err(DialError::UpstreamProxy(Error::connection(format!(
            "CONNECT refused with {}",
            code
        )))),
        Some(code) => Err(DialError::Target(Error::connection(format!(
            "CONNECT {}:{} failed with {}",
            host, port, code
        )))),
        None => Err(DialError::UpstreamProxy(Error::protocol(
            "incomplete CONNECT response",
        ))),
    }
}
