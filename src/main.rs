use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use sinkhole::commands::Commands;
use sinkhole::config::{
    BlockMode, DEFAULT_BLOCK_TTL, DEFAULT_HISTORY_CAPACITY, DEFAULT_PORT, ServerConfig,
    parse_upstream,
};
use sinkhole::control::ControlServer;
use sinkhole::server::DnsServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "sinkhole")]
#[command(about = "DNS sinkhole that blocks ad and tracker domains", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, env = "SINKHOLE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, env = "SINKHOLE_BIND", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Upstream DNS server: google, cloudflare, quad9, an IP or ip:port
    #[arg(short, long, env = "SINKHOLE_UPSTREAM", default_value = "google")]
    upstream: String,

    /// Upstream timeout in milliseconds
    #[arg(long, env = "SINKHOLE_TIMEOUT_MS", default_value_t = 3000)]
    timeout_ms: u64,

    /// How blocked domains are answered
    #[arg(long, env = "SINKHOLE_BLOCK_MODE", value_enum, default_value_t = BlockMode::Nxdomain)]
    block_mode: BlockMode,

    /// TTL of synthesized zero-ip answers
    #[arg(long, env = "SINKHOLE_BLOCK_TTL", default_value_t = DEFAULT_BLOCK_TTL)]
    block_ttl: u32,

    /// Also serve DNS over TCP
    #[arg(long, env = "SINKHOLE_TCP")]
    tcp: bool,

    /// Number of recent queries kept in memory
    #[arg(long, env = "SINKHOLE_HISTORY", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history: usize,

    /// Blocklist file to load at startup (repeatable)
    #[arg(long = "blocklist", env = "SINKHOLE_BLOCKLIST", value_delimiter = ',')]
    blocklists: Vec<PathBuf>,

    /// Control endpoint address
    #[arg(long, env = "SINKHOLE_CONTROL", default_value = "127.0.0.1:5380")]
    control: SocketAddr,

    /// Do not open the control endpoint
    #[arg(long, env = "SINKHOLE_NO_CONTROL")]
    no_control: bool,

    /// Wait for a start_dns_server command instead of starting immediately
    #[arg(long, env = "SINKHOLE_IDLE")]
    idle: bool,

    /// How long stop waits for in-flight queries, in milliseconds
    #[arg(long, env = "SINKHOLE_GRACE_MS", default_value_t = 2000)]
    grace_ms: u64,

    /// Enable debug logging
    #[arg(short, long, env = "SINKHOLE_VERBOSE")]
    verbose: bool,

    /// Log output format
    #[arg(long, env = "SINKHOLE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig, sinkhole::error::ConfigError> {
        let config = ServerConfig {
            bind_addr: self.bind,
            port: self.port,
            upstream: parse_upstream(&self.upstream)?,
            upstream_timeout: Duration::from_millis(self.timeout_ms),
            block_mode: self.block_mode,
            block_ttl: self.block_ttl,
            tcp: self.tcp,
            shutdown_grace: Duration::from_millis(self.grace_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn run(args: Args) -> sinkhole::Result<()> {
    let config = args.server_config()?;
    let server = Arc::new(DnsServer::new(args.history));
    let commands = Commands::new(server.clone(), config);

    for path in &args.blocklists {
        match commands.load_blocklist_from_file(path).await {
            Ok(added) => info!(path = %path.display(), added, "Loaded blocklist"),
            Err(e) => warn!(error = %e, "Blocklist load failed"),
        }
    }

    let control = if args.no_control {
        None
    } else {
        let control = ControlServer::bind(args.control, commands.clone())
            .await
            .map_err(|source| sinkhole::ServerError::Bind {
                addr: args.control,
                source,
            })?;
        let shutdown = control.shutdown_sender();
        Some((shutdown, tokio::spawn(control.run())))
    };

    if args.idle {
        info!("Idle; waiting for start_dns_server");
    } else {
        commands.start_dns_server().await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    if server.is_running() {
        commands.stop_dns_server().await?;
    }
    if let Some((shutdown, handle)) = control {
        let _ = shutdown.send(());
        let _ = handle.await;
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_format);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal");
            ExitCode::FAILURE
        }
    }
}
