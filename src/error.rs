//! Error types for scan setup, candidate sources, transports and scan control.

use thiserror::Error;

use crate::types::{ScanId, ScanStatus};

/// Failure to parse the base tunnel configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported scheme (expected vless:// or trojan://): {0}")]
    UnsupportedScheme(String),

    #[error("missing credential before '@'")]
    MissingCredential,

    #[error("missing host")]
    MissingHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Failure to produce candidates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("failed to fetch candidate list from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("invalid source url: {0}")]
    InvalidUrl(String),
}

/// Scan-fatal problems detected before or while the candidate pool is built.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SetupError {
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("invalid base config: {0}")]
    BaseConfig(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("scan supervisor panicked: {0}")]
    Crashed(String),
}

/// Errors returned by pause/resume/stop/status on the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("scan not found: {0}")]
    NotFound(String),

    #[error("scan {id} already finished ({status})")]
    AlreadyTerminal { id: ScanId, status: ScanStatus },

    #[error("scan {id} is not paused ({status})")]
    NotPaused { id: ScanId, status: ScanStatus },
}

/// Outcome of a single failed network exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The peer certificate failed strict verification.
    #[error("certificate rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::Unreachable(e.to_string()),
            _ => TransportError::Protocol(e.to_string()),
        }
    }
}
