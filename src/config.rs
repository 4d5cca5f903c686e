//! Environment-driven configuration.
//!
//! One immutable snapshot is built at startup and threaded through the app
//! state. Legacy environment names from earlier deployments are accepted as
//! aliases at parse time; there is no second configuration class.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::TickType;

/// Upstream gateway connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    /// Ports tried in order until one accepts.
    pub ports: Vec<u16>,
    pub client_id: i32,
    pub connection_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
    pub max_streams: usize,
    pub max_streams_per_connection: usize,
    /// Per-subscriber queue capacity.
    pub buffer_size: usize,
    pub log_level: String,
}

/// Append-store settings, including the enabled (encoding × schema) matrix.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub enable_storage: bool,
    pub storage_path: PathBuf,
    pub enable_json: bool,
    pub enable_protobuf: bool,
    pub enable_v2: bool,
    pub enable_v3: bool,
    pub enable_background_streaming: bool,
    pub tracked_contracts: Vec<TrackedContract>,
    pub background_reconnect_delay: Duration,
    /// Messages buffered in a writer before a flush is forced.
    pub buffer_size: usize,
    pub max_file_size: u64,
    pub flush_interval: Duration,
}

/// A contract the background tracker keeps subscribed for the process
/// lifetime. Configured as `cid:symbol:tt1;tt2:buffer_hours`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedContract {
    pub cid: u32,
    pub symbol: String,
    pub tick_types: Vec<TickType>,
    pub buffer_hours: u32,
}

impl TrackedContract {
    fn parse(entry: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 4 {
            bail!("tracked contract entry must be cid:symbol:tt1;tt2:buffer_hours, got {entry:?}");
        }
        let cid: u32 = parts[0]
            .trim()
            .parse()
            .with_context(|| format!("invalid contract id in {entry:?}"))?;
        let tick_types = parts[2]
            .split(';')
            .map(|t| t.trim().parse::<TickType>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid tick type in {entry:?}"))?;
        if tick_types.is_empty() {
            bail!("tracked contract {entry:?} has no tick types");
        }
        let buffer_hours: u32 = parts[3]
            .trim()
            .parse()
            .with_context(|| format!("invalid buffer hours in {entry:?}"))?;

        Ok(Self {
            cid,
            symbol: parts[1].trim().to_string(),
            tick_types,
            buffer_hours,
        })
    }
}

/// Application configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| env::var(n).ok())
        .filter(|v| !v.trim().is_empty())
}

fn env_bool(names: &[&str], default: bool) -> bool {
    env_first(names)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(names: &[&str], default: T) -> T {
    env_first(names)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build the snapshot from the environment, validating hard constraints.
    pub fn from_env() -> Result<Self> {
        let host = env_first(&["IB_HOST", "IB_STREAM_HOST"]).unwrap_or_else(|| "localhost".to_string());

        let ports_raw = env_first(&["IB_PORTS", "IB_STREAM_PORTS"]).unwrap_or_else(|| "4002".to_string());
        let ports = ports_raw
            .split(',')
            .map(|p| p.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid IB_PORTS value {ports_raw:?}"))?;
        if ports.is_empty() || ports.contains(&0) {
            bail!("IB_PORTS must list at least one nonzero port, got {ports_raw:?}");
        }

        let client_id: i32 = env_first(&["IB_CLIENT_ID", "IB_STREAM_CLIENT_ID"])
            .unwrap_or_else(|| "100".to_string())
            .trim()
            .parse()
            .context("invalid IB_CLIENT_ID")?;
        if !(1..=32767).contains(&client_id) {
            bail!("IB_CLIENT_ID must be between 1 and 32767, got {client_id}");
        }

        let connection = ConnectionConfig {
            host,
            ports,
            client_id,
            connection_timeout: Duration::from_secs(env_parse(&["IB_CONNECTION_TIMEOUT"], 10u64)),
            reconnect_attempts: env_parse(&["IB_RECONNECT_ATTEMPTS"], 5u32),
            reconnect_delay: Duration::from_secs(env_parse(&["IB_RECONNECT_DELAY"], 5u64)),
        };

        let server = ServerConfig {
            bind_host: env_first(&["IB_STREAM_BIND_HOST", "HOST"]).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse(&["IB_STREAM_PORT", "PORT"], 8001u16),
            max_streams: env_parse(&["IB_STREAM_MAX_STREAMS"], 50usize),
            max_streams_per_connection: env_parse(&["IB_STREAM_MAX_STREAMS_PER_CONNECTION"], 20usize),
            buffer_size: env_parse(&["IB_STREAM_BUFFER_SIZE"], 100usize),
            log_level: env_first(&["IB_STREAM_LOG_LEVEL"]).unwrap_or_else(|| "INFO".to_string()),
        };

        let tracked_raw = env_first(&["IB_STREAM_TRACKED_CONTRACTS"]).unwrap_or_default();
        let tracked_contracts = tracked_raw
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(TrackedContract::parse)
            .collect::<Result<Vec<_>>>()?;

        let storage = StorageConfig {
            enable_storage: env_bool(&["IB_STREAM_ENABLE_STORAGE"], true),
            storage_path: PathBuf::from(
                env_first(&["IB_STREAM_STORAGE_PATH"]).unwrap_or_else(|| "storage".to_string()),
            ),
            enable_json: env_bool(&["IB_STREAM_ENABLE_JSON"], true),
            enable_protobuf: env_bool(&["IB_STREAM_ENABLE_PROTOBUF"], false),
            enable_v2: env_bool(&["IB_STREAM_ENABLE_V2_STORAGE"], true),
            enable_v3: env_bool(&["IB_STREAM_ENABLE_V3_STORAGE"], true),
            enable_background_streaming: env_bool(&["IB_STREAM_ENABLE_BACKGROUND_STREAMING"], false),
            tracked_contracts,
            background_reconnect_delay: Duration::from_secs(env_parse(
                &["IB_STREAM_BACKGROUND_RECONNECT_DELAY"],
                30u64,
            )),
            buffer_size: env_parse(&["IB_STREAM_STORAGE_BUFFER_SIZE"], 1000usize),
            max_file_size: env_parse(&["IB_STREAM_MAX_FILE_SIZE_MB"], 100u64) * 1024 * 1024,
            flush_interval: Duration::from_millis(env_parse(&["IB_STREAM_FLUSH_INTERVAL_MS"], 250u64)),
        };

        Ok(Self {
            connection,
            server,
            storage,
        })
    }
}
