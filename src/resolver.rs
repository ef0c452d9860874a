//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline shared by all transports:
//! 1. Decode the query (malformed packets are dropped)
//! 2. Filter (block ads/trackers)
//! 3. Forward to upstream, or answer SERVFAIL if the upstream fails
//!
//! Transports handle the actual I/O, the resolver handles decisions. After
//! a transport has sent the answer it hands it back via [`Resolver::complete`]
//! so the query is recorded at send time.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::config::{BlockMode, ServerConfig};
use crate::dns::{DecodeError, DnsQuery};
use crate::filter::Blocklist;
use crate::stats::QueryLog;
use crate::transport::{Protocol, QueryLogger};
use crate::upstream::UpstreamClient;

/// Action to take for a DNS query.
pub enum QueryAction {
    /// Query is blocked, return this response immediately.
    Blocked { response: Vec<u8>, query: DnsQuery },
    /// Query should be forwarded to upstream.
    Forward { query: DnsQuery },
}

/// How a query was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Blocked,
    Forwarded { upstream_ms: f64 },
    /// Upstream failed; a SERVFAIL was synthesized.
    ServFail { upstream_ms: f64, error: String },
}

/// A response ready to be sent, plus what is needed to record it.
#[derive(Debug)]
pub struct Answer {
    pub bytes: Vec<u8>,
    pub domain: String,
    pub outcome: Outcome,
    pub protocol: Protocol,
    started: Instant,
}

impl Answer {
    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, Outcome::Blocked)
    }
}

/// Resolver handles DNS query processing decisions.
///
/// Holds shared handles to the blocklist and query log; it never owns a
/// private copy of either.
pub struct Resolver {
    blocklist: Arc<Blocklist>,
    log: Arc<QueryLog>,
    upstream: UpstreamClient,
    block_mode: BlockMode,
    block_ttl: u32,
}

impl Resolver {
    pub fn new(blocklist: Arc<Blocklist>, log: Arc<QueryLog>, config: &ServerConfig) -> Self {
        Self {
            blocklist,
            log,
            upstream: UpstreamClient::new(config.upstream, config.upstream_timeout),
            block_mode: config.block_mode,
            block_ttl: config.block_ttl,
        }
    }

    /// Decode a DNS query and decide what action to take.
    ///
    /// Call this with the raw DNS query (without TCP length prefix).
    pub fn process_query(&self, packet: &[u8]) -> Result<QueryAction, DecodeError> {
        let query = DnsQuery::parse(packet)?;

        if self.blocklist.contains(&query.domain) {
            let response = query
                .blocked_response(self.block_mode, self.block_ttl)
                .to_bytes();
            return Ok(QueryAction::Blocked { response, query });
        }

        Ok(QueryAction::Forward { query })
    }

    /// Run the full pipeline for one inbound message.
    ///
    /// Returns `None` when the packet is not a query we can answer; the
    /// transport drops it. Otherwise there is always a response to send,
    /// SERVFAIL included.
    pub async fn handle(&self, packet: &[u8], protocol: Protocol) -> Option<Answer> {
        let started = Instant::now();

        let action = match self.process_query(packet) {
            Ok(action) => action,
            Err(e) => {
                self.log.record_malformed();
                trace!(%protocol, error = %e, len = packet.len(), "Dropping undecodable packet");
                return None;
            }
        };

        match action {
            QueryAction::Blocked { response, query } => Some(Answer {
                bytes: response,
                domain: query.display_name().to_string(),
                outcome: Outcome::Blocked,
                protocol,
                started,
            }),
            QueryAction::Forward { query } => {
                let upstream_started = Instant::now();
                let result = match protocol {
                    Protocol::Udp => self.upstream.resolve(packet).await,
                    Protocol::Tcp => self.upstream.resolve_tcp(packet).await,
                };
                let upstream_ms = upstream_started.elapsed().as_secs_f64() * 1000.0;

                let (bytes, outcome) = match result {
                    Ok(reply) => (reply, Outcome::Forwarded { upstream_ms }),
                    Err(e) => {
                        self.log.record_upstream_failure();
                        (
                            query.servfail_response().to_bytes(),
                            Outcome::ServFail {
                                upstream_ms,
                                error: e.to_string(),
                            },
                        )
                    }
                };

                Some(Answer {
                    bytes,
                    domain: query.display_name().to_string(),
                    outcome,
                    protocol,
                    started,
                })
            }
        }
    }

    /// Record an answer once the transport has sent it.
    pub fn complete(&self, answer: Answer) {
        let total_ms = answer.started.elapsed().as_secs_f64() * 1000.0;
        let logger = QueryLogger::new(answer.protocol);

        match &answer.outcome {
            Outcome::Blocked => logger.blocked(&answer.domain, total_ms),
            Outcome::Forwarded { upstream_ms } => {
                logger.forwarded(&answer.domain, total_ms, *upstream_ms, self.upstream.addr())
            }
            Outcome::ServFail { upstream_ms, error } => {
                logger.servfail(&answer.domain, total_ms, *upstream_ms, error)
            }
        }

        let blocked = answer.is_blocked();
        self.log.record(answer.domain, blocked);
    }
}
