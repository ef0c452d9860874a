//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 5353;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_BLOCK_TTL: u32 = 300;
/// Query ring capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
/// Records returned by `get_recent_queries` when no limit is given.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

const MAX_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// How blocked names are answered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BlockMode {
    /// NXDOMAIN with the question echoed and no answers.
    #[default]
    Nxdomain,
    /// 0.0.0.0 for A, :: for AAAA, empty NOERROR for anything else.
    ZeroIp,
}

/// Well-known public resolvers selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProvider {
    Google,
    Cloudflare,
    Quad9,
}

impl UpstreamProvider {
    pub fn addr(self) -> SocketAddr {
        let ip = match self {
            Self::Google => Ipv4Addr::new(8, 8, 8, 8),
            Self::Cloudflare => Ipv4Addr::new(1, 1, 1, 1),
            Self::Quad9 => Ipv4Addr::new(9, 9, 9, 9),
        };
        SocketAddr::new(IpAddr::V4(ip), 53)
    }
}

impl FromStr for UpstreamProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "cloudflare" => Ok(Self::Cloudflare),
            "quad9" => Ok(Self::Quad9),
            _ => Err(()),
        }
    }
}

/// Parse an upstream given as a provider name, a bare IP (port 53) or `ip:port`.
pub fn parse_upstream(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    if let Ok(provider) = value.parse::<UpstreamProvider>() {
        return Ok(provider.addr());
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    let addr: SocketAddr = value.parse().map_err(|e: std::net::AddrParseError| {
        ConfigError::InvalidUpstream {
            value: value.to_string(),
            reason: e.to_string(),
        }
    })?;
    if addr.port() == 0 {
        return Err(ConfigError::InvalidUpstream {
            value: value.to_string(),
            reason: "port must be non-zero".into(),
        });
    }
    Ok(addr)
}

/// Configuration for one run of the DNS server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind (e.g., 127.0.0.1)
    pub bind_addr: IpAddr,
    /// Listen port; 0 picks an ephemeral port
    pub port: u16,
    /// Upstream DNS server queried for names that are not blocked
    pub upstream: SocketAddr,
    /// Bound on one upstream exchange, retry included
    pub upstream_timeout: Duration,
    pub block_mode: BlockMode,
    /// TTL of synthesized zero-ip answers
    pub block_ttl: u32,
    /// Also serve DNS over TCP on the same address
    pub tcp: bool,
    /// How long `stop` waits for in-flight queries before abandoning them
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.port() == 0 {
            return Err(ConfigError::InvalidUpstream {
                value: self.upstream.to_string(),
                reason: "port must be non-zero".into(),
            });
        }
        if self.upstream.ip().is_unspecified() {
            return Err(ConfigError::InvalidUpstream {
                value: self.upstream.to_string(),
                reason: "address is unspecified".into(),
            });
        }
        if self.upstream_timeout.is_zero() || self.upstream_timeout > MAX_UPSTREAM_TIMEOUT {
            return Err(ConfigError::invalid(
                "upstream timeout",
                format!("must be between 1ms and {MAX_UPSTREAM_TIMEOUT:?}"),
            ));
        }
        if self.shutdown_grace > MAX_SHUTDOWN_GRACE {
            return Err(ConfigError::invalid(
                "shutdown grace",
                format!("must be at most {MAX_SHUTDOWN_GRACE:?}"),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            upstream: UpstreamProvider::Google.addr(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            block_mode: BlockMode::default(),
            block_ttl: DEFAULT_BLOCK_TTL,
            tcp: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
