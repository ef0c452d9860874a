//! Transport layer implementations for the DNS sinkhole.
//!
//! Provides UDP and TCP listeners that receive DNS queries from clients,
//! run them through the [`Resolver`](crate::resolver::Resolver) and send the
//! answers back. Each query is handled in its own task so a slow upstream
//! never delays unrelated queries.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logger for DNS query events.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn blocked(&self, domain: &str, elapsed_ms: f64) {
        debug!(
            protocol = %self.protocol,
            domain,
            total_ms = elapsed_ms,
            "BLOCKED"
        );
    }

    pub fn forwarded(&self, domain: &str, total_ms: f64, upstream_ms: f64, from: SocketAddr) {
        debug!(
            protocol = %self.protocol,
            domain,
            total_ms,
            upstream_ms,
            upstream = %from,
            "FORWARDED"
        );
    }

    pub fn servfail(&self, domain: &str, total_ms: f64, upstream_ms: f64, error: &str) {
        debug!(
            protocol = %self.protocol,
            domain,
            total_ms,
            upstream_ms,
            error,
            "SERVFAIL"
        );
    }
}

/// Log a finished per-query task. Panics are the only interesting case.
fn reap(protocol: Protocol, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(%protocol, error = %e, "Query task panicked");
        }
    }
}

/// Wait up to `grace` for in-flight tasks, then abort whatever is left.
async fn drain(protocol: Protocol, mut in_flight: JoinSet<()>, grace: Duration) {
    if in_flight.is_empty() {
        return;
    }

    debug!(%protocol, pending = in_flight.len(), "Waiting for in-flight queries");
    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = in_flight.join_next().await {
            reap(protocol, joined);
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            %protocol,
            abandoned = in_flight.len(),
            "Abandoning in-flight queries after grace period"
        );
        in_flight.shutdown().await;
    }
}
