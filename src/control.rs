//! Control endpoint.
//!
//! Exposes [`Commands`] to an out-of-process status panel as JSON lines
//! over TCP: one request object per line in, one response object per line
//! out, any number of requests per connection.
//!
//! ```text
//! -> {"command":"get_stats"}
//! <- {"ok":true,"result":{"total_queries":12,"blocked_queries":3,...}}
//! -> {"command":"stop_dns_server"}
//! <- {"ok":false,"error":"DNS server is not running"}
//! ```

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::commands::Commands;

/// Longest accepted request line, newline included.
pub const MAX_REQUEST_LINE: u64 = 64 * 1024;

/// A control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    GetDnsStatus,
    GetStats,
    GetRecentQueries {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    StartDnsServer,
    StopDnsServer,
    LoadBlocklistFromFile {
        path: PathBuf,
    },
    AddToBlocklist {
        domain: String,
    },
    RemoveFromBlocklist {
        domain: String,
    },
    ListBlocklist,
}

/// Reply to one [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::error(format!("failed to encode result: {e}")),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Run one request against the command surface.
pub async fn dispatch(commands: &Commands, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::GetDnsStatus => ControlResponse::success(commands.get_dns_status()),
        ControlRequest::GetStats => ControlResponse::success(commands.get_stats()),
        ControlRequest::GetRecentQueries { limit } => {
            ControlResponse::success(commands.get_recent_queries(limit))
        }
        ControlRequest::StartDnsServer => match commands.start_dns_server().await {
            Ok(addr) => ControlResponse::success(serde_json::json!({ "address": addr })),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::StopDnsServer => match commands.stop_dns_server().await {
            Ok(()) => ControlResponse::success(Value::Null),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::LoadBlocklistFromFile { path } => {
            match commands.load_blocklist_from_file(path).await {
                Ok(added) => ControlResponse::success(added),
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }
        ControlRequest::AddToBlocklist { domain } => match commands.add_to_blocklist(&domain) {
            Ok(added) => ControlResponse::success(added),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::RemoveFromBlocklist { domain } => {
            ControlResponse::success(commands.remove_from_blocklist(&domain))
        }
        ControlRequest::ListBlocklist => ControlResponse::success(commands.list_blocklist()),
    }
}

/// TCP server for control commands.
pub struct ControlServer {
    listener: TcpListener,
    commands: Commands,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, commands: Commands) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            commands,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a shutdown signal sender
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until a shutdown signal arrives.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Control endpoint listening");
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let commands = self.commands.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, commands).await {
                                debug!(%peer, error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Control accept error");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Control endpoint shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, commands: Commands) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_LINE)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 == MAX_REQUEST_LINE {
            warn!("Control request too long, closing connection");
            let response = ControlResponse::error("request too long");
            send_response(&mut write_half, &response).await?;
            return Ok(());
        }

        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(request) {
            Ok(request) => {
                debug!(?request, "Control request");
                dispatch(&commands, request).await
            }
            Err(e) => ControlResponse::error(format!("invalid request: {e}")),
        };
        send_response(&mut write_half, &response).await?;
    }
}

async fn send_response<W>(stream: &mut W, response: &ControlResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    stream.write_all(&encoded).await?;
    stream.flush().await
}

/// Client for the control endpoint.
pub struct ControlClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let (read_half, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: &ControlRequest) -> io::Result<ControlResponse> {
        let mut encoded = serde_json::to_vec(request)?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control endpoint closed the connection",
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }
}
