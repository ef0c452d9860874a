//! TCP transport for DNS queries.
//!
//! Handles DNS queries over TCP. Each client connection is handled
//! independently: we read length-prefixed queries, resolve them, and
//! write back the responses. TCP DNS messages are prefixed with a 2-byte
//! length.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::{Protocol, drain, reap};
use crate::resolver::Resolver;

/// Connections idle longer than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport for the DNS sinkhole.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(
        self,
        resolver: Arc<Resolver>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, resolver, shutdown, grace))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                reap(Protocol::Tcp, joined);
            }

            result = listener.accept() => match result {
                Ok((client, peer)) => {
                    connections.spawn(handle_connection(
                        client,
                        peer,
                        resolver.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                }
            }
        }
    }

    info!("TCP listener stopping");
    drop(listener);
    drain(Protocol::Tcp, connections, grace).await;
}

/// Handle a single TCP connection: read queries, resolve, return responses.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let query = tokio::select! {
            _ = shutdown.changed() => return,
            read = tokio::time::timeout(IDLE_TIMEOUT, read_dns_message(&mut client)) => match read {
                Ok(Ok(Some(query))) => query,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    debug!(client = %peer, error = %e, "TCP read error");
                    return;
                }
                Err(_) => {
                    trace!(client = %peer, "Closing idle TCP connection");
                    return;
                }
            }
        };

        // Undecodable input ends the connection; there is no way to resync.
        let Some(answer) = resolver.handle(&query, Protocol::Tcp).await else {
            return;
        };

        let sent = write_dns_message(&mut client, &answer.bytes).await;
        resolver.complete(answer);
        if let Err(e) = sent {
            debug!(client = %peer, error = %e, "TCP response error");
            return;
        }
    }
}

/// Read a length-prefixed DNS message from a TCP stream.
///
/// Returns the message without its prefix, or `None` on a clean EOF
/// between messages.
pub async fn read_dns_message<R>(stream: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let msg_len = u16::from_be_bytes(len_buf) as usize;
    if msg_len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "zero-length DNS message",
        ));
    }

    let mut buf = vec![0u8; msg_len];
    stream.read_exact(&mut buf).await?;

    Ok(Some(buf))
}

/// Write a DNS message with its 2-byte length prefix.
pub async fn write_dns_message<W>(stream: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too large"))?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
