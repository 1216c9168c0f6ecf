//! Relay transport capability
//!
//! A relay connection is the authenticated session with the selected server.
//! Local proxies open channels through it; its loss is reported through the
//! disconnect callback.

mod socks5;

pub use socks5::{Socks5RelayConnection, Socks5RelayTransport};

use crate::common::net::BoxedStream;
use crate::server::ServerEntry;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Bound on relay authentication
pub const SESSION_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Invoked once when the relay connection dies on its own
pub type DisconnectCallback = Box<dyn FnOnce() + Send + 'static>;

/// Address the relay session was established with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

/// Relay login
#[derive(Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SessionPassword<'a> {
    #[serde(rename = "SessionId")]
    session_id: &'a str,
    #[serde(rename = "SshPassword")]
    ssh_password: &'a str,
}

impl RelayCredentials {
    /// Credentials binding the relay session to a client session id
    pub fn for_session(entry: &ServerEntry, client_session_id: &str) -> Result<Self> {
        let password = serde_json::to_string(&SessionPassword {
            session_id: client_session_id,
            ssh_password: &entry.ssh_password,
        })?;
        Ok(RelayCredentials {
            username: entry.ssh_username.clone(),
            password,
        })
    }
}

/// Performs relay authentication over an already-open socket
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn authenticate(
        &self,
        stream: BoxedStream,
        endpoint: RelayEndpoint,
        credentials: RelayCredentials,
    ) -> Result<Arc<dyn RelayConnection>>;
}

/// An authenticated relay session
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Open a forwarded stream to `host:port` through the relay
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Register a callback for unexpected loss of the connection. Runs
    /// immediately if the connection is already lost.
    fn on_disconnect(&self, callback: DisconnectCallback);

    /// Close the session; disconnect callbacks do not fire
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Swappable pointer to the active relay connection.
///
/// Listeners resolve it per client connection, so a preemptive reconnect
/// only has to swap the pointer; channels already open keep their stream.
#[derive(Default)]
pub struct RelayHandle {
    current: RwLock<Option<Arc<dyn RelayConnection>>>,
}

impl RelayHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(connection: Arc<dyn RelayConnection>) -> Self {
        RelayHandle {
            current: RwLock::new(Some(connection)),
        }
    }

    /// The active connection
    pub fn get(&self) -> Result<Arc<dyn RelayConnection>> {
        match self.current.read().as_ref() {
            Some(conn) if !conn.is_closed() => Ok(conn.clone()),
            _ => Err(Error::connection("relay connection not available")),
        }
    }

    /// Install `connection`, returning the one it replaces
    pub fn swap(&self, connection: Arc<dyn RelayConnection>) -> Option<Arc<dyn RelayConnection>> {
        self.current.write().replace(connection)
    }

    pub fn clear(&self) -> Option<Arc<dyn RelayConnection>> {
        self.current.write().take()
    }

    pub async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.get()?.open_channel(host, port).await
    }
}
