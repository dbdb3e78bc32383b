//! Configuration for connections and the compute server.
//!
//! [`ConnectionConfig`] carries the timing and encoding of one connection or
//! listener. [`ServerConfig`] is what the `compute-server` binary loads:
//! defaults, then an optional JSON file, then environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{heartbeat_period, CONNECTION_TIMEOUT, POLL_DELAY, POLL_INTERVAL};
use crate::protocol::EncodingKind;

/// Timing, encoding and executor ownership of a connection or listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Silence after which the connection is declared dead.
    pub timeout: Duration,
    /// Delay before the first poll tick.
    pub poll_delay: Duration,
    /// Interval between poll ticks; bounds how late a timeout is noticed.
    pub poll_interval: Duration,
    /// Heartbeat period, or `None` to send no heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Whether closing shuts the executor down.
    pub owns_executor: bool,
    /// Body encoding; both peers must agree.
    pub encoding: EncodingKind,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: CONNECTION_TIMEOUT,
            poll_delay: POLL_DELAY,
            poll_interval: POLL_INTERVAL,
            heartbeat_interval: Some(heartbeat_period(CONNECTION_TIMEOUT)),
            owns_executor: true,
            encoding: EncodingKind::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set the timeout and derive the heartbeat period from it.
    ///
    /// Heartbeats stay disabled if they already were.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        if self.heartbeat_interval.is_some() {
            self.heartbeat_interval = Some(heartbeat_period(timeout));
        }
        self
    }
}

/// Settings of the `compute-server` binary.
///
/// Durations are in milliseconds so the JSON file stays flat:
///
/// ```json
/// { "timeout_ms": 30000, "poll_interval_ms": 250, "encoding": "cbor" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the listener binds.
    pub port: u16,
    /// Connection timeout.
    pub timeout_ms: u64,
    /// Delay before the first poll tick.
    pub poll_delay_ms: u64,
    /// Interval between poll ticks.
    pub poll_interval_ms: u64,
    /// Heartbeat period. Absent: 0.9 × timeout. Zero: disabled.
    pub heartbeat_ms: Option<u64>,
    /// Body encoding.
    pub encoding: EncodingKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            timeout_ms: duration_ms(CONNECTION_TIMEOUT),
            poll_delay_ms: duration_ms(POLL_DELAY),
            poll_interval_ms: duration_ms(POLL_INTERVAL),
            heartbeat_ms: None,
            encoding: EncodingKind::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ServerConfig {
    /// Load settings for `port`: defaults, then `path` if given, then
    /// environment overrides. The port argument always wins.
    pub fn load(port: u16, path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.port = port;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply `COMPUTE_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = lookup("COMPUTE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.timeout_ms = ms;
            }
        }

        if let Some(poll_interval) = lookup("COMPUTE_POLL_INTERVAL_MS") {
            if let Ok(ms) = poll_interval.parse::<u64>() {
                self.poll_interval_ms = ms;
            }
        }

        if let Some(encoding) = lookup("COMPUTE_ENCODING") {
            match encoding.parse::<EncodingKind>() {
                Ok(kind) => self.encoding = kind,
                Err(e) => log::warn!("[Config] ignoring COMPUTE_ENCODING: {e}"),
            }
        }
    }

    /// Connection settings for the listener and the connections it accepts.
    pub fn connection(&self) -> ConnectionConfig {
        let timeout = Duration::from_millis(self.timeout_ms);
        let heartbeat_interval = match self.heartbeat_ms {
            None => Some(heartbeat_period(timeout)),
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };
        ConnectionConfig {
            timeout,
            poll_delay: Duration::from_millis(self.poll_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval,
            owns_executor: true,
            encoding: self.encoding,
        }
    }
}
