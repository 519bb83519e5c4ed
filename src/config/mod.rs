//! TOML driven client configuration.
//!
//! Precedence: built-in defaults, then the TOML file (explicit path or
//! `BLIPMQ_CLIENT_CONFIG`), then `BLIPMQ_CLIENT_*` environment variables.
//! The result is normalized and validated before use, invalid settings fail
//! at load time.
//!
//! ```toml
//! [address]
//! pingInterval = 10000
//! retries = -1
//! delay = 5000
//!
//! [address.burstMode]
//! collectTime = 0
//!
//! [queue]
//! maxEntries = 1000
//! onOverflow = "deadMessage"
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::core::queue::{FailurePolicy, OverflowPolicy, Relating};

const MIN_PING_INTERVAL_MS: i64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Collects several requests into one transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstModeConfig {
    /// Milliseconds to wait for more entries before sending, `0` sends at once.
    pub collect_time_ms: i64,
    /// Most entries per batch, `-1` for unlimited.
    pub max_entries: i64,
    /// Most bytes per batch, `-1` for unlimited.
    pub max_bytes: i64,
}

impl Default for BurstModeConfig {
    fn default() -> Self {
        Self {
            collect_time_ms: 0,
            max_entries: -1,
            max_bytes: -1,
        }
    }
}

impl BurstModeConfig {
    pub fn collect_time(&self) -> Option<Duration> {
        (self.collect_time_ms > 0).then(|| Duration::from_millis(self.collect_time_ms as u64))
    }

    pub fn entry_limit(&self) -> Option<usize> {
        usize::try_from(self.max_entries).ok()
    }

    pub fn byte_limit(&self) -> Option<u64> {
        u64::try_from(self.max_bytes).ok()
    }
}

/// How the client talks to and watches its broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressConfig {
    /// Ping period while ALIVE, `0` disables pinging.
    pub ping_interval_ms: i64,
    /// Failed reconnect attempts before giving up, `-1` retries forever.
    pub retries: i64,
    /// Pause between reconnect attempts while POLLING, `0` disables failsafe mode.
    pub delay_ms: i64,
    /// Send queued publishes without waiting for broker acknowledgement.
    pub oneway: bool,
    /// Upper bound for one ping, connect or send round trip.
    pub response_timeout_ms: u64,
    /// Delay of the first reconnect attempt after entering POLLING.
    pub initial_ping_delay_ms: u64,
    pub burst_mode: BurstModeConfig,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            retries: -1,
            delay_ms: 5_000,
            oneway: false,
            response_timeout_ms: 60_000,
            initial_ping_delay_ms: 400,
            burst_mode: BurstModeConfig::default(),
        }
    }
}

impl AddressConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms as u64))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.max(0) as u64)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Failsafe clients queue requests and poll while the broker is away.
    pub fn is_failsafe(&self) -> bool {
        self.delay_ms > 0 && self.retries != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub relating: Relating,
    pub queue_type: String,
    pub max_entries: u64,
    pub max_bytes: u64,
    /// Cache sizes of a `CACHE` queue. Read for compatibility and otherwise
    /// ignored, only `RAM` or an external store back the queue.
    pub max_entries_cache: u64,
    pub max_bytes_cache: u64,
    pub on_overflow: OverflowPolicy,
    pub on_failure: FailurePolicy,
    /// How long a `block` put waits for room.
    pub block_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            relating: Relating::Client,
            queue_type: "RAM".to_string(),
            max_entries: 1_000,
            max_bytes: 10_485_760,
            max_entries_cache: 1_000,
            max_bytes_cache: 2_097_152,
            on_overflow: OverflowPolicy::DeadMessage,
            on_failure: FailurePolicy::DeadMessage,
            block_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub capacity: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub address: AddressConfig,
    pub queue: QueueConfig,
    pub dead_letter: DeadLetterConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileConfig {
    address: Option<FileAddress>,
    queue: Option<FileQueue>,
    dead_letter: Option<FileDeadLetter>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileAddress {
    ping_interval: Option<i64>,
    retries: Option<i64>,
    delay: Option<i64>,
    oneway: Option<bool>,
    response_timeout: Option<u64>,
    initial_ping_delay: Option<u64>,
    burst_mode: Option<FileBurstMode>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileBurstMode {
    collect_time: Option<i64>,
    max_entries: Option<i64>,
    max_bytes: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileQueue {
    relating: Option<Relating>,
    #[serde(rename = "type")]
    queue_type: Option<String>,
    max_entries: Option<u64>,
    max_bytes: Option<u64>,
    max_entries_cache: Option<u64>,
    max_bytes_cache: Option<u64>,
    on_overflow: Option<OverflowPolicy>,
    on_failure: Option<FailurePolicy>,
    block_timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileDeadLetter {
    capacity: Option<usize>,
}

impl From<FileConfig> for ClientConfig {
    fn from(file: FileConfig) -> Self {
        let mut cfg = ClientConfig::default();

        if let Some(a) = file.address {
            let addr = &mut cfg.address;
            addr.ping_interval_ms = a.ping_interval.unwrap_or(addr.ping_interval_ms);
            addr.retries = a.retries.unwrap_or(addr.retries);
            addr.delay_ms = a.delay.unwrap_or(addr.delay_ms);
            addr.oneway = a.oneway.unwrap_or(addr.oneway);
            addr.response_timeout_ms = a.response_timeout.unwrap_or(addr.response_timeout_ms);
            addr.initial_ping_delay_ms = a.initial_ping_delay.unwrap_or(addr.initial_ping_delay_ms);
            if let Some(b) = a.burst_mode {
                let burst = &mut addr.burst_mode;
                burst.collect_time_ms = b.collect_time.unwrap_or(burst.collect_time_ms);
                burst.max_entries = b.max_entries.unwrap_or(burst.max_entries);
                burst.max_bytes = b.max_bytes.unwrap_or(burst.max_bytes);
            }
        }

        if let Some(q) = file.queue {
            let queue = &mut cfg.queue;
            queue.relating = q.relating.unwrap_or(queue.relating);
            if let Some(t) = q.queue_type {
                queue.queue_type = t;
            }
            queue.max_entries = q.max_entries.unwrap_or(queue.max_entries);
            queue.max_bytes = q.max_bytes.unwrap_or(queue.max_bytes);
            queue.max_entries_cache = q.max_entries_cache.unwrap_or(queue.max_entries_cache);
            queue.max_bytes_cache = q.max_bytes_cache.unwrap_or(queue.max_bytes_cache);
            queue.on_overflow = q.on_overflow.unwrap_or(queue.on_overflow);
            queue.on_failure = q.on_failure.unwrap_or(queue.on_failure);
            queue.block_timeout_ms = q.block_timeout.unwrap_or(queue.block_timeout_ms);
        }

        if let Some(d) = file.dead_letter {
            cfg.dead_letter.capacity = d.capacity.unwrap_or(cfg.dead_letter.capacity);
        }

        cfg
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{key}: {e}")))
}

impl ClientConfig {
    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("BLIPMQ_CLIENT_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let file_cfg = match effective_path {
            Some(p) => Self::load_file(p)?,
            None => FileConfig::default(),
        };

        let mut cfg = ClientConfig::from(file_cfg);
        cfg.apply_overrides(|key| env::var(key).ok())?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a TOML document, without looking at the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file_cfg: FileConfig = toml::from_str(raw)?;
        let mut cfg = ClientConfig::from(file_cfg);
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Applies `BLIPMQ_CLIENT_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BLIPMQ_CLIENT_PING_INTERVAL") {
            self.address.ping_interval_ms = parse_env("BLIPMQ_CLIENT_PING_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_RETRIES") {
            self.address.retries = parse_env("BLIPMQ_CLIENT_RETRIES", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_DELAY") {
            self.address.delay_ms = parse_env("BLIPMQ_CLIENT_DELAY", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_ONEWAY") {
            self.address.oneway =
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_COLLECT_TIME") {
            self.address.burst_mode.collect_time_ms =
                parse_env("BLIPMQ_CLIENT_COLLECT_TIME", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_MAX_ENTRIES") {
            self.queue.max_entries = parse_env("BLIPMQ_CLIENT_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_MAX_BYTES") {
            self.queue.max_bytes = parse_env("BLIPMQ_CLIENT_MAX_BYTES", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_ON_OVERFLOW") {
            self.queue.on_overflow = parse_env("BLIPMQ_CLIENT_ON_OVERFLOW", &v)?;
        }
        if let Some(v) = lookup("BLIPMQ_CLIENT_ON_FAILURE") {
            self.queue.on_failure = parse_env("BLIPMQ_CLIENT_ON_FAILURE", &v)?;
        }
        Ok(())
    }

    /// Brings out-of-range values that have an obvious meaning into range.
    pub fn normalize(&mut self) {
        let addr = &mut self.address;
        if addr.ping_interval_ms < 0 {
            addr.ping_interval_ms = 0;
        } else if addr.ping_interval_ms > 0 && addr.ping_interval_ms < MIN_PING_INTERVAL_MS {
            warn!(
                target: "blipmq_client::config",
                requested = addr.ping_interval_ms,
                "pingInterval too small, using {MIN_PING_INTERVAL_MS} ms"
            );
            addr.ping_interval_ms = MIN_PING_INTERVAL_MS;
        }

        let burst = &mut addr.burst_mode;
        burst.collect_time_ms = burst.collect_time_ms.max(0);
        burst.max_entries = burst.max_entries.max(-1);
        burst.max_bytes = burst.max_bytes.max(-1);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let addr = &self.address;
        let queue = &self.queue;

        if addr.retries < -1 {
            return invalid(format!("address.retries must be >= -1, got {}", addr.retries));
        }
        if addr.delay_ms < 0 {
            return invalid(format!("address.delay must be >= 0, got {}", addr.delay_ms));
        }
        if addr.response_timeout_ms == 0 {
            return invalid("address.responseTimeout must be > 0".into());
        }
        if addr.initial_ping_delay_ms == 0 {
            return invalid("address.initialPingDelay must be > 0".into());
        }
        if addr.burst_mode.max_entries == 0 {
            return invalid("address.burstMode.maxEntries must be -1 or > 0".into());
        }
        if addr.burst_mode.max_bytes == 0 {
            return invalid("address.burstMode.maxBytes must be -1 or > 0".into());
        }
        if queue.max_entries < 1 {
            return invalid("queue.maxEntries must be > 0".into());
        }
        if queue.max_bytes < 1 {
            return invalid("queue.maxBytes must be > 0".into());
        }
        if queue.queue_type.trim().is_empty() {
            return invalid("queue.type must not be empty".into());
        }
        if self.dead_letter.capacity < 1 {
            return invalid("deadLetter.capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Loads and validates a configuration file, ignoring the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    ClientConfig::from_toml_str(&raw)
}
