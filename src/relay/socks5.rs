//! SOCKS5-authenticated relay transport
//!
//! The probe socket performs a username/password negotiation and stays open
//! as the control connection. Each channel is a fresh SOCKS5 CONNECT to the
//! same endpoint with the same credentials. EOF or an error on the control
//! connection is reported as a disconnect.

use super::{
    DisconnectCallback, RelayConnection, RelayCredentials, RelayEndpoint, RelayTransport,
    SESSION_ESTABLISHMENT_TIMEOUT,
};
use crate::common::dialer::Dialer;
use crate::common::net::BoxedStream;
use crate::common::socks::{client_authenticate, client_connect};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay transport speaking SOCKS5 to the relay server
#[derive(Debug, Clone)]
pub struct Socks5RelayTransport {
    dialer: Dialer,
    auth_timeout: Duration,
}

impl Socks5RelayTransport {
    pub fn new(dialer: Dialer) -> Self {
        Socks5RelayTransport {
            dialer,
            auth_timeout: SESSION_ESTABLISHMENT_TIMEOUT,
        }
    }

    pub fn with_auth_timeout(mut self, auth_timeout: Duration) -> Self {
        self.auth_timeout = auth_timeout;
        self
    }
}

#[async_trait]
impl RelayTransport for Socks5RelayTransport {
    async fn authenticate(
        &self,
        mut stream: BoxedStream,
        endpoint: RelayEndpoint,
        credentials: RelayCredentials,
    ) -> Result<Arc<dyn RelayConnection>> {
        timeout(
            self.auth_timeout,
            client_authenticate(&mut stream, &credentials.username, &credentials.password),
        )
        .await
        .map_err(|_| Error::timeout("relay authentication timed out"))??;
        info!("Relay session established with {}:{}", endpoint.host, endpoint.port);

        let connection = Arc::new(Socks5RelayConnection {
            endpoint,
            credentials,
            dialer: self.dialer.clone(),
            channel_timeout: self.auth_timeout,
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(monitor_control(
            Arc::downgrade(&connection),
            stream,
            connection.shutdown.clone(),
        ));
        Ok(connection)
    }
}

/// Watch the control connection until it ends or the session is closed
async fn monitor_control(
    connection: Weak<Socks5RelayConnection>,
    mut control: BoxedStream,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            read = control.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Relay control connection closed by peer");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("Relay control connection failed: {}", e);
                    break;
                }
            },
            _ = shutdown.cancelled() => return,
        }
    }
    if let Some(connection) = connection.upgrade() {
        connection.mark_disconnected();
    }
}

/// Authenticated SOCKS5 relay session
pub struct Socks5RelayConnection {
    endpoint: RelayEndpoint,
    credentials: RelayCredentials,
    dialer: Dialer,
    channel_timeout: Duration,
    closed: AtomicBool,
    disconnected: AtomicBool,
    callbacks: Mutex<Vec<DisconnectCallback>>,
    shutdown: CancellationToken,
}

impl Socks5RelayConnection {
    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    fn mark_disconnected(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "Relay connection to {}:{} lost",
            self.endpoint.host, self.endpoint.port
        );
        let callbacks: Vec<DisconnectCallback> = {
            let mut callbacks = self.callbacks.lock();
            self.disconnected.store(true, Ordering::SeqCst);
            callbacks.drain(..).collect()
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl RelayConnection for Socks5RelayConnection {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        if self.is_closed() {
            return Err(Error::connection("relay connection is closed"));
        }
        let mut stream = self
            .dialer
            .connect(&self.endpoint.host, self.endpoint.port, self.channel_timeout)
            .await?;
        timeout(self.channel_timeout, async {
            client_authenticate(
                &mut stream,
                &self.credentials.username,
                &self.credentials.password,
            )
            .await?;
            client_connect(&mut stream, host, port).await
        })
        .await
        .map_err(|_| Error::timeout(format!("relay channel to {}:{} timed out", host, port)))??;
        debug!("Relay channel opened to {}:{}", host, port);
        Ok(Box::new(stream))
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        let mut callbacks = self.callbacks.lock();
        if self.disconnected.load(Ordering::SeqCst) {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(callback);
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            self.callbacks.lock().clear();
            debug!(
                "Relay connection to {}:{} closed",
                self.endpoint.host, self.endpoint.port
            );
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Socks5RelayConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
