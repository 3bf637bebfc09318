//! Command line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::bus::DEFAULT_EVENT_CAPACITY;
use crate::rate_limit::{RateLimitConfig, DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_SUSTAINED};

/// Default port for the queue server.
pub const DEFAULT_PORT: u16 = 9474;

/// Climb queue session server.
#[derive(Debug, Clone, Parser)]
#[command(name = "climb-queue", version, about)]
pub struct Args {
    /// Address to bind.
    #[arg(long, env = "QUEUE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "QUEUE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Base URL of the climb-data service used to refresh stats on angle changes.
    #[arg(long, env = "CLIMB_DATA_URL")]
    pub climb_data_url: Option<String>,

    /// Per-item timeout for climb-data lookups, in milliseconds.
    #[arg(long, env = "CLIMB_FETCH_TIMEOUT_MS", default_value_t = 5000)]
    pub climb_fetch_timeout_ms: u64,

    /// Per-session event buffer before slow clients are resynced.
    #[arg(long, env = "QUEUE_EVENT_CAPACITY", default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,

    /// Frames a socket may send back to back.
    #[arg(long, env = "WS_RATE_LIMIT_BURST", default_value_t = DEFAULT_RATE_LIMIT_BURST)]
    pub ws_rate_limit_burst: u32,

    /// Sustained frames per second per socket.
    #[arg(long, env = "WS_RATE_LIMIT_SUSTAINED", default_value_t = DEFAULT_RATE_LIMIT_SUSTAINED)]
    pub ws_rate_limit_sustained: u32,

    /// Extra CORS origin (repeatable).
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,
}

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Climb-data service base URL.
    pub climb_data_url: Option<String>,
    /// Per-item climb-data timeout.
    pub climb_fetch_timeout: Duration,
    /// Per-session broadcast buffer.
    pub event_capacity: usize,
    /// Per-socket inbound limits.
    pub rate_limit: RateLimitConfig,
    /// CORS origins beyond the server's own.
    pub allowed_origins: Vec<String>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            addr: SocketAddr::new(args.bind, args.port),
            climb_data_url: args.climb_data_url.filter(|url| !url.trim().is_empty()),
            climb_fetch_timeout: Duration::from_millis(args.climb_fetch_timeout_ms.max(1)),
            event_capacity: args.event_capacity.max(1),
            rate_limit: RateLimitConfig {
                burst: args.ws_rate_limit_burst.max(1),
                sustained: args.ws_rate_limit_sustained,
            },
            allowed_origins: args.allowed_origins,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            climb_data_url: None,
            climb_fetch_timeout: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            rate_limit: RateLimitConfig::default(),
            allowed_origins: Vec::new(),
        }
    }
}
