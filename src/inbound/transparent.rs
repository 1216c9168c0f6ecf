//! Transparent proxy inbound
//!
//! Accepts connections redirected by NAT rules and carries them to their
//! original destination through the relay. The destination is read with
//! SO_ORIGINAL_DST, so this only works on Linux and IPv4.

use super::{ListenerSlot, LocalProxyListener};
use crate::common::net::{configure_tcp_stream, copy_bidirectional_owned};
use crate::relay::RelayHandle;
use crate::statistic::{StatsReporter, TrackedStream};
use crate::Result;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transparent (NAT redirect) proxy listener
pub struct TransparentProxyListener {
    relay: Arc<RelayHandle>,
    stats: Arc<StatsReporter>,
    slot: ListenerSlot,
}

impl TransparentProxyListener {
    pub fn new(relay: Arc<RelayHandle>, stats: Arc<StatsReporter>) -> Self {
        TransparentProxyListener {
            relay,
            stats,
            slot: ListenerSlot::new("Transparent"),
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
                    debug!("Transparent connection error from {}: {}", peer_addr, e);
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
    let target = original_destination(&stream)?;
    debug!("Transparent {} -> {}", peer_addr, target);

    let remote = relay
        .open_channel(&target.ip().to_string(), target.port())
        .await?;
    let remote = TrackedStream::new(remote, stats);
    let (sent, received) = copy_bidirectional_owned(stream, remote).await?;
    debug!(
        "Transparent {} -> {} completed (sent: {}, received: {})",
        peer_addr, target, sent, received
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    // SAFETY: fd is a live socket owned by `stream`; addr and len describe a
    // correctly sized sockaddr_in buffer.
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        if addr.sin_family != libc::AF_INET as libc::sa_family_t {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "original destination is not IPv4",
            ));
        }
        let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
        Ok(SocketAddr::new(ip, u16::from_be(addr.sin_port)))
    }
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent proxying requires Linux",
    ))
}

#[async_trait]
impl LocalProxyListener for TransparentProxyListener {
    fn name(&self) -> &str {
        "Transparent"
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
    use crate::config::StatsConfig;

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let handle = Arc::new(RelayHandle::new());
        let stats = Arc::new(StatsReporter::new(&StatsConfig::default()));
        let listener = TransparentProxyListener::new(handle, stats);
        assert_eq!(listener.port(), None);

        let port = listener.start(0).await.unwrap();
        assert!(listener.is_running());
        assert_eq!(listener.port(), Some(port));
        assert!(listener.start(0).await.is_err());

        listener.stop().await.unwrap();
        assert!(!listener.is_running());
    }
}
