//! Error types for the tunnel client

use std::io;
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by retry loops and status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, user visible, never retried
    Configuration,
    /// Probe/connect/handshake timeouts and refusals; retried with backoff
    TransientNetwork,
    /// Signature or payload mismatch
    Protocol,
    /// File I/O on persisted state; always non-fatal
    Persistence,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Error::Persistence(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Unsupported(_) => ErrorKind::Configuration,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Parse(_) | Error::Protocol(_) | Error::Auth(_) | Error::Crypto(_) => {
                ErrorKind::Protocol
            }
            Error::Io(_)
            | Error::Connection(_)
            | Error::Timeout(_)
            | Error::Tls(_)
            | Error::Address(_)
            | Error::Internal(_) => ErrorKind::TransientNetwork,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Connection(e.to_string())
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a remote server list fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("remote server list fetch is not due yet")]
    NotDue,

    #[error("network is unavailable")]
    NetworkUnavailable,

    #[error("remote server list failed authentication: {0}")]
    AuthenticationFailed(String),

    #[error("remote server list transport error: {0}")]
    TransportError(String),

    #[error("remote server list fetch stopped")]
    Stopped,
}

/// Failure of a signed package verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("package signed with a different public key")]
    WrongKey,

    #[error("malformed package: {0}")]
    Malformed(String),
}

/// Outcome of a tunnel attempt that did not end in a clean run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("no servers available")]
    NoServersAvailable,

    #[error("elevated privilege denied")]
    PrivilegeDenied,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("relay authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("transport broken: {0}")]
    TransportBroken(String),

    #[error("stop requested")]
    StopRequested,

    #[error("unexpected disconnect")]
    UnexpectedDisconnect,
}

impl TunnelError {
    /// Fatal errors end the outer loop and are surfaced to the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::NoServersAvailable | TunnelError::PrivilegeDenied
        )
    }

    /// Whether the outer loop should start another attempt
    pub fn should_retry(&self) -> bool {
        !self.is_fatal() && *self != TunnelError::StopRequested
    }

    /// Whether the server in use should be moved to the tail of the store
    pub fn marks_server_failed(&self) -> bool {
        matches!(
            self,
            TunnelError::HandshakeFailed(_)
                | TunnelError::AuthenticationFailed(_)
                | TunnelError::TransportBroken(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::NoServersAvailable | TunnelError::PrivilegeDenied => {
                ErrorKind::Configuration
            }
            TunnelError::HandshakeFailed(_) => ErrorKind::Protocol,
            _ => ErrorKind::TransientNetwork,
        }
    }
}

impl From<Error> for TunnelError {
    fn from(e: Error) -> Self {
        match e {
            Error::Auth(msg) => TunnelError::AuthenticationFailed(msg),
            Error::Protocol(msg) | Error::Parse(msg) => TunnelError::HandshakeFailed(msg),
            other => TunnelError::TransportBroken(other.to_string()),
        }
    }
}
