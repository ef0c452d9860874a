//! Sinkhole - a DNS sinkhole proxy.
//!
//! Answers queries for blocklisted domains (and their subdomains) locally
//! and forwards everything else to an upstream resolver. Every answered
//! query is kept in a bounded history with running counters, and the
//! server can be started, stopped and fed new blocklists at runtime
//! through [`commands::Commands`] or the JSON control endpoint.

pub mod commands;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use commands::Commands;
pub use config::{BlockMode, ServerConfig};
pub use error::{Result, ServerError};
pub use filter::Blocklist;
pub use server::{DnsServer, ServerState};
pub use stats::{QueryLog, QueryRecord, Stats};
