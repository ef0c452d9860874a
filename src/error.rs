//! Error types for the sinkhole.
//!
//! Only command-surface operations return these to callers. Per-packet
//! failures on the hot path are absorbed by the transports and counted.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the server lifecycle and the command surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("DNS server is already running")]
    AlreadyRunning,

    #[error("DNS server is not running")]
    NotRunning,

    /// Binding the listener failed (port in use, insufficient privilege).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blocklist(#[from] BlocklistError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid upstream '{value}': {reason}")]
    InvalidUpstream { value: String, reason: String },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from the blocklist store.
#[derive(Debug, Error)]
pub enum BlocklistError {
    /// Reading the file failed. Domains parsed before the failure are kept;
    /// `added` is how many of them were new.
    #[error("failed to read blocklist {}: {source} ({added} domains loaded before the error)", path.display())]
    Read {
        path: PathBuf,
        added: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),
}

impl BlocklistError {
    /// Number of new domains committed before the error, if any.
    pub fn added(&self) -> usize {
        match self {
            Self::Read { added, .. } => *added,
            Self::InvalidDomain(_) => 0,
        }
    }
}

/// Failures talking to the upstream resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream {upstream} timed out after {timeout:?}")]
    Timeout {
        upstream: SocketAddr,
        timeout: Duration,
    },

    #[error("upstream {upstream} I/O error: {source}")]
    Io {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed reply from upstream {upstream}: {reason}")]
    Malformed {
        upstream: SocketAddr,
        reason: &'static str,
    },
}

impl ResolveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
