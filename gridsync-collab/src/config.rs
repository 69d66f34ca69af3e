//! Hub and server configuration.
//!
//! Defaults suit local development. `ServerConfig::from_env` reads a `.env`
//! file when present and then `GRIDSYNC_*` variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `GRIDSYNC_BIND` | `127.0.0.1:8500` |
//! | `GRIDSYNC_PATH_PREFIX` | `/ws/` |
//! | `GRIDSYNC_STORAGE_PATH` | `gridsync_data` |
//! | `GRIDSYNC_IN_MEMORY` | unset (`1`/`true` skips RocksDB) |
//! | `GRIDSYNC_MAILBOX_CAPACITY` | `256` |
//! | `GRIDSYNC_SEND_TIMEOUT_MS` | `5000` |
//! | `GRIDSYNC_IDLE_TIMEOUT_SECS` | `300` (`0` disables) |
//! | `GRIDSYNC_FLUSH_RETRIES` | `3` |
//! | `GRIDSYNC_FLUSH_BACKOFF_MS` | `200` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::HubError;

/// Per-session and per-connection tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Outbound mailbox slots per client
    pub mailbox_capacity: usize,
    /// Deadline for one frame sent to one recipient
    pub send_timeout: Duration,
    /// Tear a connection down after this long without inbound frames
    pub idle_timeout: Option<Duration>,
    /// Flush attempts before the failure is reported
    pub flush_retries: u32,
    /// Delay before the second attempt, doubled after each failure
    pub flush_backoff: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            send_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
            flush_retries: 3,
            flush_backoff: Duration::from_millis(200),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade path prefix; the rest of the path is the document id
    pub path_prefix: String,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8500".to_string(),
            path_prefix: "/ws/".to_string(),
            storage_path: Some(PathBuf::from("gridsync_data")),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `.env` and the process environment.
    pub fn from_env() -> Result<Self, HubError> {
        if let Ok(path) = dotenv::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns per variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HubError> {
        let mut config = Self::default();

        if let Some(bind) = lookup("GRIDSYNC_BIND") {
            config.bind_addr = bind;
        }
        if let Some(prefix) = lookup("GRIDSYNC_PATH_PREFIX") {
            config.path_prefix = prefix;
        }
        if let Some(path) = lookup("GRIDSYNC_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("GRIDSYNC_IN_MEMORY") {
            if matches!(flag.as_str(), "1" | "true" | "yes") {
                config.storage_path = None;
            }
        }
        if let Some(n) = parse(&lookup, "GRIDSYNC_MAILBOX_CAPACITY")? {
            if n == 0 {
                return Err(HubError::Config("GRIDSYNC_MAILBOX_CAPACITY must be > 0".into()));
            }
            config.hub.mailbox_capacity = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "GRIDSYNC_SEND_TIMEOUT_MS")? {
            config.hub.send_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "GRIDSYNC_IDLE_TIMEOUT_SECS")? {
            config.hub.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse::<u32>(&lookup, "GRIDSYNC_FLUSH_RETRIES")? {
            config.hub.flush_retries = n.max(1);
        }
        if let Some(ms) = parse::<u64>(&lookup, "GRIDSYNC_FLUSH_BACKOFF_MS")? {
            config.hub.flush_backoff = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, HubError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HubError::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}
