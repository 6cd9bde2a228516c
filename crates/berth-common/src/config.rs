//! Configuration model for berth clients.
//!
//! Every field has a default so a partial JSON file is valid; a missing
//! file is not an error and yields [`BerthConfig::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// Root configuration for berth clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Base URL of the daemon's HTTP API.
    pub daemon_url: String,
    /// Event monitor settings.
    pub monitor: MonitorConfig,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            daemon_url: constants::DEFAULT_DAEMON_URL.to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl BerthConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| BerthError::io("reading config", e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| BerthError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !self.daemon_url.starts_with("http://") && !self.daemon_url.starts_with("https://") {
            return Err(BerthError::Config {
                message: format!("daemon_url must be an http(s) URL: {}", self.daemon_url),
            });
        }
        if self.monitor.queue_capacity == Some(0) {
            return Err(BerthError::Config {
                message: "monitor.queue_capacity must be positive (omit it for unbounded)".into(),
            });
        }
        Ok(())
    }
}

/// Settings for the event monitor and its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Per-subscription queue capacity; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// What dispatch does when a subscription's queue is full.
    pub overflow: OverflowPolicy,
    /// How a dropped event connection is re-established.
    pub reconnect: ReconnectPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Some(constants::DEFAULT_QUEUE_CAPACITY),
            overflow: OverflowPolicy::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Behaviour when an event targets a subscription whose queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room; gives up only if the subscription is cancelled.
    Block,
    /// Discard the incoming event.
    DropNewest,
    /// Discard the oldest queued event to make room.
    #[default]
    DropOldest,
}

/// Exponential backoff schedule for reconnecting the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before the monitor gives up and deactivates; 0 disables.
    pub max_retries: u32,
    /// Delay before the first attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on the delay between attempts, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: constants::DEFAULT_MAX_RECONNECTS,
            initial_backoff_ms: constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before the given attempt (1-based), doubling up to the cap.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
