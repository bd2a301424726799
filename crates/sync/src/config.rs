//! Session configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::poll::DEFAULT_POLL_INTERVAL;
use crate::quiescence::DEFAULT_QUIESCENCE_THRESHOLD;
use crate::reconnect::ReconnectConfig;

/// Settings shared by single-job and list sessions.
///
/// Defaults suit a local development server.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the REST API (default: `http://localhost:8000/api`).
    pub api_url: String,
    /// Base URL of the push endpoint (default: `ws://localhost:8000`).
    pub ws_url: String,
    /// Backstop poll interval (default: 5s).
    pub poll_interval: Duration,
    pub reconnect: ReconnectConfig,
    /// Quiet period after a terminal status (default: 3000ms).
    pub quiescence_threshold: Duration,
    /// Fingerprints remembered per job (default: 10000).
    pub dedup_capacity: usize,
}

/// A configuration variable held a value that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".into(),
            ws_url: "ws://localhost:8000".into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect: ReconnectConfig::default(),
            quiescence_threshold: DEFAULT_QUIESCENCE_THRESHOLD,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                     |
    /// |---------------------------|-----------------------------|
    /// | `SCANWATCH_API_URL`       | `http://localhost:8000/api` |
    /// | `SCANWATCH_WS_URL`        | `ws://localhost:8000`       |
    /// | `POLL_INTERVAL_SECS`      | `5`                         |
    /// | `RECONNECT_BASE_MS`       | `1000`                      |
    /// | `RECONNECT_MAX_ATTEMPTS`  | `5`                         |
    /// | `QUIESCENCE_THRESHOLD_MS` | `3000`                      |
    /// | `DEDUP_CAPACITY`          | `10000`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`SyncConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("SCANWATCH_API_URL").unwrap_or(defaults.api_url);
        let ws_url = lookup("SCANWATCH_WS_URL").unwrap_or(defaults.ws_url);

        let poll_secs: u64 = parse_var(&lookup, "POLL_INTERVAL_SECS", "a positive integer")?
            .unwrap_or(defaults.poll_interval.as_secs());
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                expected: "a positive integer",
                value: "0".into(),
            });
        }

        let base_ms: u64 = parse_var(&lookup, "RECONNECT_BASE_MS", "an integer")?
            .unwrap_or(defaults.reconnect.base_delay.as_millis() as u64);
        let max_attempts: u32 = parse_var(&lookup, "RECONNECT_MAX_ATTEMPTS", "an integer")?
            .unwrap_or(defaults.reconnect.max_attempts);
        let quiet_ms: u64 = parse_var(&lookup, "QUIESCENCE_THRESHOLD_MS", "an integer")?
            .unwrap_or(defaults.quiescence_threshold.as_millis() as u64);
        let dedup_capacity: usize = parse_var(&lookup, "DEDUP_CAPACITY", "an integer")?
            .unwrap_or(defaults.dedup_capacity);

        Ok(Self {
            api_url,
            ws_url,
            poll_interval: Duration::from_secs(poll_secs),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(base_ms),
                max_attempts,
            },
            quiescence_threshold: Duration::from_millis(quiet_ms),
            dedup_capacity,
        })
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value: raw,
            }),
    }
}
