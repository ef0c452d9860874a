//! Server lifecycle.
//!
//! [`DnsServer`] owns the shared blocklist and query log for the lifetime
//! of the process, and at most one running set of listeners at a time.
//! State moves only along Stopped -> Starting -> Running -> Stopping ->
//! Stopped. `start` and `stop` hold the control lock while they check and
//! change state, so concurrent `start` calls cannot both pass the Stopped
//! check.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::filter::Blocklist;
use crate::resolver::Resolver;
use crate::stats::{QueryLog, Stats};
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;

/// Interval of the periodic summary line while running.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Extra time past the grace period before listener tasks are aborted.
const STOP_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Readable without waiting on an in-progress start or stop.
struct Status {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    started: Option<Instant>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    started: Instant,
    grace: Duration,
}

/// The DNS sinkhole server instance.
pub struct DnsServer {
    blocklist: Arc<Blocklist>,
    log: Arc<QueryLog>,
    status: Arc<RwLock<Status>>,
    running: Mutex<Option<Running>>,
}

impl DnsServer {
    /// Create a stopped server whose query ring holds `history_capacity` records.
    pub fn new(history_capacity: usize) -> Self {
        Self::with_blocklist(Arc::new(Blocklist::new()), history_capacity)
    }

    pub fn with_blocklist(blocklist: Arc<Blocklist>, history_capacity: usize) -> Self {
        Self {
            blocklist,
            log: Arc::new(QueryLog::new(history_capacity)),
            status: Arc::new(RwLock::new(Status {
                state: ServerState::Stopped,
                local_addr: None,
                started: None,
            })),
            running: Mutex::new(None),
        }
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn query_log(&self) -> &Arc<QueryLog> {
        &self.log
    }

    pub fn state(&self) -> ServerState {
        self.status.read().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Address the UDP listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status.read().local_addr
    }

    fn set_state(&self, state: ServerState) {
        set_state(&self.status, state);
    }

    /// Bind the listeners and begin answering queries.
    ///
    /// Returns the bound UDP address, which differs from the configured one
    /// when port 0 was requested. On any failure the server stays Stopped.
    pub async fn start(&self, config: &ServerConfig) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if self.state() != ServerState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }

        config.validate()?;

        self.set_state(ServerState::Starting);
        let starting = StartGuard {
            status: &self.status,
            armed: true,
        };
        info!(addr = %config.listen_addr(), upstream = %config.upstream, "Starting DNS server");

        let (udp, tcp, local_addr) = match bind(config).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!(error = %e, "DNS server failed to start");
                return Err(e);
            }
        };
        let resolver = Arc::new(Resolver::new(
            self.blocklist.clone(),
            self.log.clone(),
            config,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = Instant::now();

        let mut handles = Vec::with_capacity(3);
        handles.push(udp.start(resolver.clone(), shutdown_rx.clone(), config.shutdown_grace));
        if let Some(tcp) = tcp {
            handles.push(tcp.start(resolver, shutdown_rx.clone(), config.shutdown_grace));
        }
        handles.push(tokio::spawn(log_summaries(
            self.blocklist.clone(),
            self.log.clone(),
            started,
            shutdown_rx,
        )));

        *running = Some(Running {
            shutdown_tx,
            handles,
            local_addr,
            started,
            grace: config.shutdown_grace,
        });
        *self.status.write() = Status {
            state: ServerState::Running,
            local_addr: Some(local_addr),
            started: Some(started),
        };
        starting.disarm();
        info!(
            addr = %local_addr,
            tcp = config.tcp,
            blocklist_size = self.blocklist.len(),
            "DNS server listening"
        );

        Ok(local_addr)
    }

    /// Stop listening and wait for in-flight queries.
    ///
    /// Listeners stop reading on the shutdown signal. A socket closes once
    /// the queries still using it finish or are abandoned after the grace
    /// period. Teardown runs in its own task, so the server always reaches
    /// Stopped even if the caller stops waiting.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if self.state() != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        let Some(run) = running.take() else {
            self.set_state(ServerState::Stopped);
            return Err(ServerError::NotRunning);
        };

        self.set_state(ServerState::Stopping);
        info!(addr = %run.local_addr, "Stopping DNS server");

        let task = tokio::spawn(teardown(run, self.status.clone()));
        if let Err(e) = task.await {
            warn!(error = %e, "Shutdown task failed");
            self.set_state(ServerState::Stopped);
        }
        Ok(())
    }

    /// Snapshot of the counters. Cheap enough to poll.
    pub fn stats(&self) -> Stats {
        let uptime_secs = self
            .status
            .read()
            .started
            .map_or(0, |started| started.elapsed().as_secs());
        let counts = self.log.counts();

        Stats {
            total_queries: counts.total_queries,
            blocked_queries: counts.blocked_queries,
            blocklist_size: self.blocklist.len(),
            upstream_failures: self.log.upstream_failures(),
            malformed_packets: self.log.malformed_packets(),
            uptime_secs,
        }
    }
}

impl Default for DnsServer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_CAPACITY)
    }
}

fn set_state(status: &RwLock<Status>, state: ServerState) {
    let mut status = status.write();
    status.state = state;
    if state == ServerState::Stopped {
        status.local_addr = None;
        status.started = None;
    }
}

/// Puts the server back to Stopped unless start got all the way to Running.
struct StartGuard<'a> {
    status: &'a RwLock<Status>,
    armed: bool,
}

impl StartGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            set_state(self.status, ServerState::Stopped);
        }
    }
}

async fn teardown(run: Running, status: Arc<RwLock<Status>>) {
    let _ = run.shutdown_tx.send(true);

    let aborts: Vec<_> = run.handles.iter().map(|h| h.abort_handle()).collect();
    let joined = tokio::time::timeout(run.grace + STOP_SLACK, join_all(run.handles)).await;
    match joined {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!(error = %e, "Listener task panicked");
                    }
                }
            }
        }
        Err(_) => {
            warn!("Listeners did not stop within the grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    set_state(&status, ServerState::Stopped);
    info!(uptime_secs = run.started.elapsed().as_secs(), "DNS server stopped");
}

async fn bind(
    config: &ServerConfig,
) -> Result<(UdpTransport, Option<TcpTransport>, SocketAddr)> {
    let addr = config.listen_addr();
    let udp = UdpTransport::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = udp.local_addr()?;

    if !config.tcp {
        return Ok((udp, None, local_addr));
    }

    // Share the port UDP actually got, so port 0 yields one address.
    let tcp = TcpTransport::bind(local_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: local_addr,
            source,
        })?;

    Ok((udp, Some(tcp), local_addr))
}

async fn log_summaries(
    blocklist: Arc<Blocklist>,
    log: Arc<QueryLog>,
    started: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {
                let counts = log.counts();
                info!(
                    uptime_secs = started.elapsed().as_secs(),
                    total = counts.total_queries,
                    blocked = counts.blocked_queries,
                    upstream_failures = log.upstream_failures(),
                    blocklist_size = blocklist.len(),
                    "Summary"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> ServerConfig {
        ServerConfig {
            port: 0,
            upstream: "127.0.0.1:9".parse().unwrap(),
            shutdown_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_then_stop() {
        let server = DnsServer::new(8);
        assert_eq!(server.state(), ServerState::Stopped);

        let addr = server.start(&ephemeral()).await.unwrap();

        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await.unwrap();

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let server = DnsServer::new(8);
        server.start(&ephemeral()).await.unwrap();

        let err = server.start(&ephemeral()).await.unwrap_err();

        assert!(matches!(err, ServerError::AlreadyRunning));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_not_running() {
        let server = DnsServer::new(8);

        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_stopped() {
        let squatter = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: squatter.local_addr().unwrap().port(),
            ..ephemeral()
        };
        let server = DnsServer::new(8);

        let err = server.start(&config).await.unwrap_err();

        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_binding() {
        let config = ServerConfig {
            upstream_timeout: Duration::ZERO,
            ..ephemeral()
        };
        let server = DnsServer::new(8);

        assert!(matches!(
            server.start(&config).await,
            Err(ServerError::Config(_))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn restart_releases_the_port_and_keeps_counters() {
        let server = DnsServer::new(8);
        let addr = server.start(&ephemeral()).await.unwrap();
        server.query_log().record("example.com", false);
        server.stop().await.unwrap();

        let config = ServerConfig {
            port: addr.port(),
            ..ephemeral()
        };
        let again = server.start(&config).await.unwrap();

        assert_eq!(again, addr);
        assert_eq!(server.stats().total_queries, 1);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stats_reflect_blocklist_and_uptime_resets_when_stopped() {
        let server = DnsServer::new(8);
        server.blocklist().load(["ads.example.com", "tracker.net"]);

        let stats = server.stats();

        assert_eq!(stats.blocklist_size, 2);
        assert_eq!(stats.uptime_secs, 0);
        assert_eq!(stats.total_queries, 0);
    }

    /// Starts a server whose upstream never answers and leaves one
    /// forwarded query waiting on it.
    async fn with_query_in_flight(
        upstream_timeout: Duration,
    ) -> (DnsServer, tokio::net::UdpSocket, tokio::net::UdpSocket) {
        let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            upstream: upstream.local_addr().unwrap(),
            upstream_timeout,
            ..ephemeral()
        };
        let server = DnsServer::new(8);
        let addr = server.start(&config).await.unwrap();

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&crate::dns::build_query(7, "example.org", crate::dns::TYPE_A), addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        (server, upstream, client)
    }

    #[tokio::test]
    async fn cancelled_stop_still_reaches_stopped() {
        let (server, _upstream, _client) = with_query_in_flight(Duration::from_secs(2)).await;

        let cancelled = tokio::time::timeout(Duration::from_millis(20), server.stop()).await;
        assert!(cancelled.is_err());

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.state() != ServerState::Stopped && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.state(), ServerState::Stopped);

        server.start(&ephemeral()).await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_abandons_forward_after_grace() {
        let (server, _upstream, _client) = with_query_in_flight(Duration::from_secs(5)).await;

        let begun = Instant::now();
        server.stop().await.unwrap();

        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one() {
        let server = Arc::new(DnsServer::new(8));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                tokio::spawn(async move { server.start(&ephemeral()).await })
            })
            .collect();
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ServerError::AlreadyRunning)))
                .count(),
            7
        );
        assert_eq!(server.state(), ServerState::Running);
        server.stop().await.unwrap();
    }

    #[test]
    fn abandoned_start_resets_to_stopped() {
        let status = RwLock::new(Status {
            state: ServerState::Starting,
            local_addr: None,
            started: None,
        });

        drop(StartGuard {
            status: &status,
            armed: true,
        });
        assert_eq!(status.read().state, ServerState::Stopped);

        set_state(&status, ServerState::Starting);
        StartGuard {
            status: &status,
            armed: true,
        }
        .disarm();
        assert_eq!(status.read().state, ServerState::Starting);
    }
}
