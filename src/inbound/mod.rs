//! Local proxy listeners
//!
//! Every listener binds on loopback, carries client traffic through the
//! active relay connection and counts bytes into the stats reporter. The
//! accept loop runs on its own task; client connections run on tasks of
//! their own and outlive a stop or rebind of the listener.

mod dns;
mod http;
mod socks5;
mod transparent;

pub use dns::DnsProxyListener;
pub use http::HttpProxyListener;
pub use socks5::Socks5ProxyListener;
pub use transparent::TransparentProxyListener;

use crate::common::net::{bind_available_port, bind_with_retry};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Retry interval while a port is still held by a previous listener
pub const REBIND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Trait for local proxy listeners
#[async_trait]
pub trait LocalProxyListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &str;

    /// Bind the preferred port or one of the next few, start accepting and
    /// return the bound port
    async fn start(&self, preferred_port: u16) -> Result<u16>;

    /// Release the port and bind it again, retrying while it is in use
    /// until `deadline` or `cancel`
    async fn rebind(&self, deadline: Instant, cancel: &CancellationToken) -> Result<u16>;

    /// Stop accepting; connections already accepted keep running
    async fn stop(&self) -> Result<()>;

    /// Check if listener is running
    fn is_running(&self) -> bool;

    /// Bound port, if running
    fn port(&self) -> Option<u16>;
}

struct AcceptTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Accept-loop lifecycle shared by the TCP listeners
pub(crate) struct ListenerSlot {
    name: &'static str,
    running: AtomicBool,
    port: AtomicU16,
    task: Mutex<Option<AcceptTask>>,
}

impl ListenerSlot {
    pub(crate) fn new(name: &'static str) -> Self {
        ListenerSlot {
            name,
            running: AtomicBool::new(false),
            port: AtomicU16::new(0),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub(crate) async fn start<H, F>(&self, preferred_port: u16, handler: H) -> Result<u16>
    where
        H: Fn(TcpStream, SocketAddr) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Err(Error::internal(format!("{} listener already running", self.name)));
        }
        let listener = bind_available_port(preferred_port).await?;
        self.serve(listener, handler)
    }

    pub(crate) async fn rebind<H, F>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<u16>
    where
        H: Fn(TcpStream, SocketAddr) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let port = self
            .port()
            .ok_or_else(|| Error::internal(format!("{} listener was never started", self.name)))?;
        self.stop().await;
        let listener = bind_with_retry(port, REBIND_RETRY_INTERVAL, deadline, cancel).await?;
        self.serve(listener, handler)
    }

    fn serve<H, F>(&self, listener: TcpListener, handler: H) -> Result<u16>
    where
        H: Fn(TcpStream, SocketAddr) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!("{} proxy listening on {}", self.name, addr);

        let name = self.name;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(handler(stream, peer_addr));
                        }
                        Err(e) => error!("{} accept error: {}", name, e),
                    },
                    _ = token.cancelled() => break,
                }
            }
            debug!("{} accept loop finished", name);
        });

        *self.task.lock() = Some(AcceptTask { shutdown, handle });
        self.port.store(addr.port(), Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(addr.port())
    }

    /// Stop the accept loop and wait until the socket is released
    pub(crate) async fn stop(&self) {
        let task = self.task.lock().take();
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = task {
            task.shutdown.cancel();
            let _ = task.handle.await;
            debug!("{} listener stopped", self.name);
        }
    }
}

/// Stop every listener, logging failures
pub async fn stop_all(listeners: &[Arc<dyn LocalProxyListener>]) {
    for listener in listeners {
        if let Err(e) = listener.stop().await {
            error!("Failed to stop {} listener: {}", listener.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn greet(mut stream: TcpStream, _peer: SocketAddr) {
        let _ = stream.write_all(b"hi").await;
    }

    #[tokio::test]
    async fn test_slot_lifecycle() {
        let slot = ListenerSlot::new("test");
        assert!(!slot.is_running());
        assert_eq!(slot.port(), None);

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let preferred = probe.local_addr().unwrap().port();
        drop(probe);

        let port = slot.start(preferred, greet).await.unwrap();
        assert!(slot.is_running());
        assert_eq!(slot.port(), Some(port));
        assert!(slot.start(preferred, greet).await.is_err());

        slot.stop().await;
        assert!(!slot.is_running());
        // Port was released
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_rebind_keeps_port() {
        let slot = ListenerSlot::new("test");
        let port = slot.start(0, greet).await.unwrap();
        let rebound = slot
            .rebind(
                Instant::now() + Duration::from_secs(2),
                &CancellationToken::new(),
                greet,
            )
            .await
            .unwrap();
        assert_eq!(rebound, port);
        assert!(slot.is_running());
        slot.stop().await;
    }
}
