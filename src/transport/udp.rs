//! UDP transport for DNS queries.
//!
//! One receive loop reads datagrams and spawns a task per query. Each
//! task resolves independently and replies from the shared listening
//! socket, so responses may leave in a different order than queries
//! arrived.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{MAX_DNS_PACKET_SIZE, Protocol, drain, reap};
use crate::resolver::Resolver;

/// UDP transport for the DNS sinkhole.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Runs until `shutdown` flips (or its sender is dropped), then gives
    /// in-flight queries `grace` to finish. The socket is closed when the
    /// returned task completes.
    pub fn start(
        self,
        resolver: Arc<Resolver>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver, shutdown, grace))
    }
}

/// Main receive loop for UDP transport.
async fn run(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut in_flight = JoinSet::new();
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                reap(Protocol::Udp, joined);
            }

            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "UDP recv error");
                        continue;
                    }
                };

                let packet = buf[..len].to_vec();
                in_flight.spawn(handle_datagram(
                    socket.clone(),
                    resolver.clone(),
                    packet,
                    src,
                ));
            }
        }
    }

    info!("UDP listener stopping");
    drain(Protocol::Udp, in_flight, grace).await;
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    packet: Vec<u8>,
    src: SocketAddr,
) {
    let Some(answer) = resolver.handle(&packet, Protocol::Udp).await else {
        return;
    };

    if let Err(e) = socket.send_to(&answer.bytes, src).await {
        debug!(client = %src, error = %e, "UDP response error");
    }

    resolver.complete(answer);
}
