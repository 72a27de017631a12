use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use socorro_fanout::FanoutConfig;
use socorro_lifecycle::{CoordinationConfig, RetryPolicy};
use socorro_store::{InMemoryRecordStore, RecordStore, SqliteRecordStore};
use tracing_subscriber::filter::LevelFilter;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(
    name = "socorro-gateway",
    about = "Emergency request coordination gateway (HTTP + WebSocket)",
    version
)]
pub struct Cli {
    #[arg(
        long = "bind",
        env = "SOCORRO_BIND",
        default_value = "127.0.0.1:8787",
        help = "Socket address the gateway listens on (host:port)"
    )]
    pub bind: String,

    #[arg(
        long = "store",
        env = "SOCORRO_STORE",
        value_enum,
        default_value_t = CliStoreBackend::Memory,
        help = "Record store backend"
    )]
    pub store: CliStoreBackend,

    #[arg(
        long = "sqlite-path",
        env = "SOCORRO_SQLITE_PATH",
        default_value = ".socorro/socorro.sqlite",
        help = "Database file used when --store=sqlite"
    )]
    pub sqlite_path: PathBuf,

    #[arg(
        long = "subscriber-queue-capacity",
        env = "SOCORRO_SUBSCRIBER_QUEUE_CAPACITY",
        default_value_t = 256,
        value_parser = parse_positive_usize,
        help = "Envelopes buffered per subscriber before it must resync"
    )]
    pub subscriber_queue_capacity: usize,

    #[arg(
        long = "replay-window",
        env = "SOCORRO_REPLAY_WINDOW",
        default_value_t = 1_024,
        help = "Recent envelopes retained for subscription.resume (0 disables replay)"
    )]
    pub replay_window: usize,

    #[arg(
        long = "store-retry-attempts",
        env = "SOCORRO_STORE_RETRY_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_u32,
        help = "Total attempts for record store calls that fail transiently"
    )]
    pub store_retry_attempts: u32,

    #[arg(
        long = "store-retry-initial-backoff-ms",
        env = "SOCORRO_STORE_RETRY_INITIAL_BACKOFF_MS",
        default_value_t = 50,
        value_parser = parse_positive_u64,
        help = "Initial backoff delay in milliseconds for transient record store failures"
    )]
    pub store_retry_initial_backoff_ms: u64,

    #[arg(
        long = "store-retry-max-backoff-ms",
        env = "SOCORRO_STORE_RETRY_MAX_BACKOFF_MS",
        default_value_t = 1_000,
        value_parser = parse_positive_u64,
        help = "Maximum backoff delay in milliseconds for transient record store failures"
    )]
    pub store_retry_max_backoff_ms: u64,

    #[arg(
        long = "heartbeat-interval-seconds",
        env = "SOCORRO_HEARTBEAT_INTERVAL_SECONDS",
        default_value_t = 15,
        value_parser = parse_positive_u64,
        help = "Interval between WebSocket heartbeat frames"
    )]
    pub heartbeat_interval_seconds: u64,

    #[arg(
        long = "log-level",
        env = "SOCORRO_LOG_LEVEL",
        default_value = "info",
        help = "Default log level when RUST_LOG is unset (error, warn, info, debug, trace)"
    )]
    pub log_level: LevelFilter,
}

/// Record store selected at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

impl StoreBackend {
    pub fn open(&self) -> Result<Arc<dyn RecordStore>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemoryRecordStore::new())),
            Self::Sqlite(path) => {
                let store = SqliteRecordStore::new(path)
                    .with_context(|| format!("failed to open sqlite store {}", path.display()))?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Resolved gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    pub bind: String,
    pub store: StoreBackend,
    pub coordination: CoordinationConfig,
    pub heartbeat_interval: Duration,
}

impl Cli {
    pub fn server_config(&self) -> Result<GatewayServerConfig> {
        let coordination = CoordinationConfig {
            retry: RetryPolicy {
                max_attempts: self.store_retry_attempts,
                initial_backoff: Duration::from_millis(self.store_retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.store_retry_max_backoff_ms),
            },
            fanout: FanoutConfig {
                subscriber_queue_capacity: self.subscriber_queue_capacity,
                replay_window: self.replay_window,
            },
        };
        coordination
            .validate()
            .context("invalid coordination settings")?;

        let store = match self.store {
            CliStoreBackend::Memory => StoreBackend::Memory,
            CliStoreBackend::Sqlite => StoreBackend::Sqlite(self.sqlite_path.clone()),
        };
        Ok(GatewayServerConfig {
            bind: self.bind.clone(),
            store,
            coordination,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
        })
    }
}
