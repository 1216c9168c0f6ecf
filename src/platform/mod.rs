//! Platform capabilities consumed by the tunnel
//!
//! OS-level VPN interfaces and transparent-routing rules are provided by the
//! embedding application. The defaults here degrade gracefully: no VPN,
//! routing that only records its state, an effective-uid privilege check and
//! a route-lookup connectivity check.

use crate::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// OS-level VPN interface used in whole-device mode
#[async_trait]
pub trait PlatformVpn: Send + Sync {
    fn name(&self) -> &str;

    /// Route device traffic into the local SOCKS and DNS listeners
    async fn establish(&self, socks_port: u16, dns_port: u16) -> Result<()>;

    async fn teardown(&self) -> Result<()>;

    fn is_established(&self) -> bool;
}

/// Transparent proxy redirection (iptables style) used in whole-device mode
/// when no VPN capability exists
#[async_trait]
pub trait TransparentRouting: Send + Sync {
    async fn start(&self, transparent_port: u16, dns_port: u16) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}

/// Result of an elevated-privilege check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeStatus {
    Granted,
    Denied,
    /// Not decided yet (e.g. a prompt is pending); poll again
    Unknown,
}

pub trait PrivilegeChecker: Send + Sync {
    fn check(&self) -> PrivilegeStatus;
}

/// Whether any network path is currently available
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Routing that tracks its own state and leaves the actual rule
/// installation to the host
#[derive(Default)]
pub struct RecordingTransparentRouting {
    active: AtomicBool,
}

#[async_trait]
impl TransparentRouting for RecordingTransparentRouting {
    async fn start(&self, transparent_port: u16, dns_port: u16) -> Result<()> {
        info!(
            "Transparent routing requested: tcp -> 127.0.0.1:{}, dns -> 127.0.0.1:{}",
            transparent_port, dns_port
        );
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Transparent routing released");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Granted when running with an effective uid of 0
#[derive(Debug, Default, Clone, Copy)]
pub struct EffectiveUidChecker;

impl PrivilegeChecker for EffectiveUidChecker {
    #[cfg(unix)]
    fn check(&self) -> PrivilegeStatus {
        if nix::unistd::geteuid().is_root() {
            PrivilegeStatus::Granted
        } else {
            PrivilegeStatus::Denied
        }
    }

    #[cfg(not(unix))]
    fn check(&self) -> PrivilegeStatus {
        PrivilegeStatus::Denied
    }
}

/// Connected when the OS has a route towards a public address.
///
/// Connecting a UDP socket sends nothing; it only performs the route lookup.
#[derive(Debug, Clone, Copy)]
pub struct RouteProbeMonitor {
    target: SocketAddr,
}

impl Default for RouteProbeMonitor {
    fn default() -> Self {
        RouteProbeMonitor {
            target: SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)),
        }
    }
}

impl NetworkMonitor for RouteProbeMonitor {
    fn is_connected(&self) -> bool {
        let connected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| socket.connect(self.target))
            .is_ok();
        if !connected {
            debug!("No route to {}", self.target);
        }
        connected
    }
}

/// Always reports connectivity
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeConnected;

impl NetworkMonitor for AssumeConnected {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Bundle of platform capabilities handed to the tunnel
#[derive(Clone)]
pub struct Platform {
    pub vpn: Option<Arc<dyn PlatformVpn>>,
    pub routing: Arc<dyn TransparentRouting>,
    pub privilege: Arc<dyn PrivilegeChecker>,
    pub network: Arc<dyn NetworkMonitor>,
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            vpn: None,
            routing: Arc::new(RecordingTransparentRouting::default()),
            privilege: Arc::new(EffectiveUidChecker),
            network: Arc::new(RouteProbeMonitor::default()),
        }
    }
}
