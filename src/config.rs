use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::script::Network;

/// Which stored representation transactions are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// Pre-joined rows carrying jsonb arrays of inputs/outputs/addresses.
    Blob,
    /// Legacy transaction x txin x txout cross join.
    Join,
}

impl FromStr for RowShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blob" => Ok(RowShape::Blob),
            "join" => Ok(RowShape::Join),
            other => Err(Error::Config(format!("unknown ROW_SHAPE {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub blocks_path: Option<PathBuf>,
    pub bridge_addr: SocketAddr,
    pub chain_feed_addr: Option<String>,
    pub notify_channels: Vec<String>,
    pub subscriber_queue: usize,
    pub subscriber_write_timeout: Duration,
    pub network: Network,
    pub row_shape: RowShape,
    pub pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            blocks_path: None,
            bridge_addr: SocketAddr::from(([0, 0, 0, 0], 8082)),
            chain_feed_addr: None,
            notify_channels: vec!["blocks_notify".into(), "address_notify".into()],
            subscriber_queue: 64,
            subscriber_write_timeout: Duration::from_millis(2000),
            network: Network::Mainnet,
            row_shape: RowShape::Blob,
            pool_size: 16,
        }
    }
}

impl Config {
    /// Read configuration from the process environment. Call
    /// `dotenv().ok()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let database_url = get("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("DATABASE_URL must be set".into()))?;

        let bridge_addr = match get("BRIDGE_ADDR") {
            Some(addr) => addr
                .parse()
                .map_err(|e| Error::Config(format!("BRIDGE_ADDR {addr:?}: {e}")))?,
            None => defaults.bridge_addr,
        };

        let notify_channels = match get("NOTIFY_CHANNELS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.notify_channels,
        };

        Ok(Config {
            database_url,
            blocks_path: get("BLOCKS_PATH").map(PathBuf::from),
            bridge_addr,
            chain_feed_addr: get("CHAIN_FEED_ADDR").filter(|v| !v.is_empty()),
            notify_channels,
            subscriber_queue: parse_or(&get, "SUBSCRIBER_QUEUE", defaults.subscriber_queue)?,
            subscriber_write_timeout: Duration::from_millis(parse_or(
                &get,
                "SUBSCRIBER_WRITE_TIMEOUT_MS",
                defaults.subscriber_write_timeout.as_millis() as u64,
            )?),
            network: parse_or(&get, "NETWORK", defaults.network)?,
            row_shape: parse_or(&get, "ROW_SHAPE", defaults.row_shape)?,
            pool_size: parse_or(&get, "POOL_SIZE", defaults.pool_size)?,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key} {raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug)]
pub struct Context {
    pub config: Config,
}

impl Context {
    pub fn new(config: Config) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { config })
    }

    pub fn network(&self) -> Network {
        self.config.network
    }
}
