//! Per-attempt session state

use crate::api::{HandshakeResponse, RequestParams, ServerApi};
use crate::config::ClientConfig;
use crate::inbound::LocalProxyListener;
use crate::relay::RelayConnection;
use crate::server::ServerEntry;
use crate::statistic::{StatusPayload, StatusUploader};
use crate::Result;
use async_trait::async_trait;
use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "DISCONNECTED"),
            TunnelState::Connecting => write!(f, "CONNECTING"),
            TunnelState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// 16 random bytes, hex encoded
pub fn new_client_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// State of one connection attempt, dropped when the attempt ends
pub struct SessionContext {
    pub client_session_id: String,
    pub entry: Option<ServerEntry>,
    pub relay_protocol: String,
    pub server_session_id: Option<String>,
    pub handshake: Option<HandshakeResponse>,
    pub listeners: Vec<Arc<dyn LocalProxyListener>>,
    /// Previous connection kept alive after a preemptive switch
    pub retired: Option<Arc<dyn RelayConnection>>,
    /// Time between preemptive reconnects
    pub preemptive_period: Option<Duration>,
    pub preemptive_at: Option<Instant>,
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext {
            client_session_id: new_client_session_id(),
            entry: None,
            relay_protocol: String::new(),
            server_session_id: None,
            handshake: None,
            listeners: Vec::new(),
            retired: None,
            preemptive_period: None,
            preemptive_at: None,
        }
    }

    pub fn request_params(&self, client: &ClientConfig, whole_device: bool) -> Option<RequestParams> {
        self.entry.as_ref().map(|entry| RequestParams {
            entry: entry.clone(),
            client_session_id: self.client_session_id.clone(),
            relay_protocol: self.relay_protocol.clone(),
            tunnel_whole_device: whole_device,
            client: client.clone(),
        })
    }

    pub fn listener_port(&self, name: &str) -> Option<u16> {
        self.listeners
            .iter()
            .find(|l| l.name() == name)
            .and_then(|l| l.port())
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends status payloads for an established session
pub struct SessionStatusUploader {
    api: Arc<dyn ServerApi>,
    params: RequestParams,
    server_session_id: String,
}

impl SessionStatusUploader {
    pub fn new(api: Arc<dyn ServerApi>, params: RequestParams, server_session_id: String) -> Self {
        SessionStatusUploader {
            api,
            params,
            server_session_id,
        }
    }
}

#[async_trait]
impl StatusUploader for SessionStatusUploader {
    async fn upload(&self, payload: &StatusPayload, is_final: bool) -> Result<()> {
        self.api
            .status(&self.params, &self.server_session_id, payload, is_final)
            .await
    }
}

/// Interval between preemptive reconnects for a server-advertised lifetime:
/// half the lifetime minus five seconds, never negative
pub fn preemptive_period(lifetime: Duration) -> Duration {
    (lifetime / 2).saturating_sub(Duration::from_secs(5))
}
