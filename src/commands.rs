//! Command surface polled by the status panel.
//!
//! Each operation is a snapshot or a single state change on the shared
//! [`DnsServer`]; none of them touch the per-query hot path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::{DEFAULT_RECENT_LIMIT, ServerConfig};
use crate::error::{BlocklistError, Result, ServerError};
use crate::server::DnsServer;
use crate::stats::{QueryRecord, Stats};

/// Typed handlers for every control command.
#[derive(Clone)]
pub struct Commands {
    server: Arc<DnsServer>,
    config: Arc<RwLock<ServerConfig>>,
}

impl Commands {
    /// `config` is used by every subsequent `start_dns_server`.
    pub fn new(server: Arc<DnsServer>, config: ServerConfig) -> Self {
        Self {
            server,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn server(&self) -> &Arc<DnsServer> {
        &self.server
    }

    pub fn get_dns_status(&self) -> bool {
        self.server.is_running()
    }

    pub fn get_stats(&self) -> Stats {
        self.server.stats()
    }

    /// Most recent first. `limit` defaults to 100 and is capped at the ring capacity.
    pub fn get_recent_queries(&self, limit: Option<usize>) -> Vec<QueryRecord> {
        let log = self.server.query_log();
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(log.capacity());
        log.recent(limit)
    }

    pub async fn start_dns_server(&self) -> Result<SocketAddr> {
        let config = self.config.read().clone();
        self.server.start(&config).await
    }

    pub async fn stop_dns_server(&self) -> Result<()> {
        self.server.stop().await
    }

    /// Merge a blocklist file into the store; returns the number of new domains.
    ///
    /// File I/O runs on the blocking pool. On a mid-file read error the
    /// domains read so far stay loaded and the error reports how many.
    pub async fn load_blocklist_from_file(&self, path: impl Into<PathBuf>) -> Result<usize> {
        let path = path.into();
        let blocklist = self.server.blocklist().clone();

        let added = tokio::task::spawn_blocking(move || blocklist.load_file(&path))
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))??;

        info!(added, total = self.server.blocklist().len(), "Blocklist loaded");
        Ok(added)
    }

    /// Returns `true` if the domain was not already present.
    pub fn add_to_blocklist(&self, domain: &str) -> std::result::Result<bool, BlocklistError> {
        self.server.blocklist().add(domain)
    }

    /// Returns `true` if the entry existed.
    pub fn remove_from_blocklist(&self, domain: &str) -> bool {
        self.server.blocklist().remove(domain)
    }

    pub fn list_blocklist(&self) -> Vec<String> {
        self.server.blocklist().domains()
    }

    /// Replace the configuration used by the next start.
    pub fn set_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }
}
