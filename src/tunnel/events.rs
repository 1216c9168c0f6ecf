//! Tunnel lifecycle events and the user-visible status stream

use super::TunnelState;
use crate::api::HandshakeResponse;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Entries kept for subscribers that attach late
pub const STATUS_HISTORY_SIZE: usize = 500;

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Callbacks from the tunnel state machine to its host
pub trait EventSink: Send + Sync {
    fn on_tunnel_starting(&self) {}

    fn on_state_changed(&self, _state: TunnelState) {}

    fn on_handshake_success(&self, _handshake: &HandshakeResponse) {}

    fn on_unexpected_disconnect(&self) {}

    fn on_tunnel_stopping(&self) {}
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One line of user-visible status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

/// Broadcast status stream with a bounded history.
///
/// Every entry is mirrored into `tracing`.
pub struct StatusLog {
    tx: broadcast::Sender<StatusEntry>,
    history: Mutex<VecDeque<StatusEntry>>,
}

impl StatusLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        StatusLog {
            tx,
            history: Mutex::new(VecDeque::with_capacity(STATUS_HISTORY_SIZE)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEntry> {
        self.tx.subscribe()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<StatusEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(Severity::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.publish(Severity::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(Severity::Error, message.into());
    }

    fn publish(&self, severity: Severity, message: String) {
        match severity {
            Severity::Info => info!(target: "relay_tunnel::status", "{}", message),
            Severity::Warning => warn!(target: "relay_tunnel::status", "{}", message),
            Severity::Error => error!(target: "relay_tunnel::status", "{}", message),
        }

        let entry = StatusEntry {
            timestamp: Utc::now(),
            severity,
            message,
        };
        {
            let mut history = self.history.lock();
            if history.len() == STATUS_HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(entry);
    }
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_broadcast() {
        let log = StatusLog::new();
        let mut rx = log.subscribe();
        log.info("connecting");
        log.warning("retrying");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.severity, Severity::Info);
        assert_eq!(first.message, "connecting");
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
    }

    #[test]
    fn test_history_is_bounded() {
        let log = StatusLog::new();
        for i in 0..STATUS_HISTORY_SIZE + 5 {
            log.info(format!("entry {}", i));
        }
        let history = log.history();
        assert_eq!(history.len(), STATUS_HISTORY_SIZE);
        assert_eq!(history[0].message, "entry 5");
        assert_eq!(
            history.last().map(|e| e.message.as_str()),
            Some(format!("entry {}", STATUS_HISTORY_SIZE + 4).as_str())
        );
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Warning.to_string(), "warning");
        let entry = StatusEntry {
            timestamp: Utc::now(),
            severity: Severity::Error,
            message: "x".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["severity"], "error");
    }
}
