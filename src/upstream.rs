//! Upstream DNS client.
//!
//! Forwards raw queries that passed the blocklist to the configured
//! resolver. Every exchange runs against a single deadline so a dead
//! upstream costs at most `timeout`, whatever happens inside.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::dns::{is_response, message_id, set_message_id};
use crate::error::ResolveError;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Client for one upstream resolver.
///
/// Stateless between calls: each query uses its own ephemeral socket and a
/// fresh random transaction id, so concurrent queries never share state.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn io_error(&self, source: io::Error) -> ResolveError {
        ResolveError::Io {
            upstream: self.addr,
            source,
        }
    }

    fn timed_out(&self) -> ResolveError {
        ResolveError::Timeout {
            upstream: self.addr,
            timeout: self.timeout,
        }
    }

    fn local_bind_addr(&self) -> SocketAddr {
        if self.addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        }
    }

    /// Resolve a query over UDP.
    ///
    /// Returns the upstream reply with its transaction id rewritten to the
    /// id of `query`. Replies with a foreign id are ignored until the
    /// deadline. A failed send is retried once immediately.
    pub async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let deadline = Instant::now() + self.timeout;
        let client_id = message_id(query).unwrap_or_default();
        let upstream_id: u16 = rand::random();

        let mut packet = query.to_vec();
        set_message_id(&mut packet, upstream_id);

        let socket = UdpSocket::bind(self.local_bind_addr())
            .await
            .map_err(|e| self.io_error(e))?;
        socket.connect(self.addr).await.map_err(|e| self.io_error(e))?;

        if let Err(e) = socket.send(&packet).await {
            debug!(upstream = %self.addr, error = %e, "Upstream send failed, retrying once");
            socket.send(&packet).await.map_err(|e| self.io_error(e))?;
        }

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => return Err(self.timed_out()),
                Ok(Err(e)) => return Err(self.io_error(e)),
                Ok(Ok(len)) => len,
            };

            let reply = &buf[..len];
            if !is_response(reply) || message_id(reply) != Some(upstream_id) {
                trace!(upstream = %self.addr, len, "Ignoring unexpected upstream datagram");
                continue;
            }

            let mut reply = reply.to_vec();
            set_message_id(&mut reply, client_id);
            return Ok(reply);
        }
    }

    /// Resolve a query over TCP (RFC 1035 length-prefixed framing).
    pub async fn resolve_tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let deadline = Instant::now() + self.timeout;
        let client_id = message_id(query).unwrap_or_default();
        let upstream_id: u16 = rand::random();

        let mut packet = Vec::with_capacity(query.len() + 2);
        packet.extend_from_slice(&(query.len() as u16).to_be_bytes());
        packet.extend_from_slice(query);
        set_message_id(&mut packet[2..], upstream_id);

        let exchange = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            stream.write_all(&packet).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut reply).await?;
            Ok::<_, io::Error>(reply)
        };

        let mut reply = match timeout_at(deadline, exchange).await {
            Err(_) => return Err(self.timed_out()),
            Ok(Err(e)) => return Err(self.io_error(e)),
            Ok(Ok(reply)) => reply,
        };

        if !is_response(&reply) {
            return Err(ResolveError::Malformed {
                upstream: self.addr,
                reason: "reply is not a DNS response",
            });
        }
        if message_id(&reply) != Some(upstream_id) {
            return Err(ResolveError::Malformed {
                upstream: self.addr,
                reason: "transaction id mismatch",
            });
        }

        set_message_id(&mut reply, client_id);
        Ok(reply)
    }
}
