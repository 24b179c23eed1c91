// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client configuration.
//!
//! A [`ClientConfig`] is usually assembled through
//! [`AgoClient::builder`](crate::AgoClient::builder), but daemons may also
//! load it from a JSON file:
//!
//! ```json
//! {
//!   "app_name": "zwave",
//!   "transport": { "mqtt": { "host": "localhost", "port": 1883 } },
//!   "topic": "agocontrol",
//!   "inventory_timeout_ms": 3000
//! }
//! ```
//!
//! Durations are given in milliseconds and every field except `app_name`
//! has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::protocol::TransportConfig;

/// Default shared bus topic.
pub const DEFAULT_TOPIC: &str = "agocontrol";

/// State directory used when the platform reports no data directory.
const FALLBACK_STATE_DIR: &str = "/var/opt/agocontrol";

/// Deserializes a [`Duration`] from a number of milliseconds.
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Returns the default state directory (`<data dir>/agocontrol`).
#[must_use]
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from(FALLBACK_STATE_DIR),
        |dir| dir.join("agocontrol"),
    )
}

/// Settings of one bus client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Short name of the daemon. Used as `handled-by` in announcements and
    /// as the file stem of its uuid map.
    pub app_name: String,
    /// Broker to connect to.
    pub transport: TransportConfig,
    /// Shared bus topic.
    pub topic: String,
    /// Directory holding `uuidmap/<app_name>.json`.
    pub state_dir: PathBuf,
    /// Whether the uuid map is written to disk.
    pub persist_uuids: bool,
    /// Whether commands for devices of other daemons are ignored.
    pub filter_commands: bool,
    /// Bounded receive timeout of the dispatch loop.
    #[serde(rename = "receive_poll_ms", with = "serde_millis")]
    pub receive_poll: Duration,
    /// How long [`AgoClient::inventory`](crate::AgoClient::inventory) waits.
    #[serde(rename = "inventory_timeout_ms", with = "serde_millis")]
    pub inventory_timeout: Duration,
    /// Backoff between session recreation attempts.
    pub reconnection: ReconnectionPolicy,
    /// Retries of controller resolution.
    pub controller_lookup: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            transport: TransportConfig::default(),
            topic: DEFAULT_TOPIC.to_string(),
            state_dir: default_state_dir(),
            persist_uuids: true,
            filter_commands: true,
            receive_poll: Duration::from_secs(1),
            inventory_timeout: Duration::from_secs(3),
            reconnection: ReconnectionPolicy::default(),
            controller_lookup: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a default configuration for the daemon `app_name`.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// it lacks a required setting.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), app = %config.app_name, "Loaded client configuration");
        Ok(config)
    }

    /// Checks that required settings are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming the first missing setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Missing("app_name"));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Missing("topic"));
        }
        Ok(())
    }

    /// Returns the uuid map file, or `None` when persistence is disabled.
    #[must_use]
    pub fn uuid_map_path(&self) -> Option<PathBuf> {
        self.persist_uuids.then(|| {
            self.state_dir
                .join("uuidmap")
                .join(format!("{}.json", self.app_name))
        })
    }
}

/// Configuration for automatic session recreation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use agobus_lib::config::ReconnectionPolicy;
///
/// // Default policy (infinite retries with exponential backoff)
/// let policy = ReconnectionPolicy::default();
/// assert!(policy.should_retry(1_000));
///
/// // Custom policy
/// let policy = ReconnectionPolicy::new()
///     .with_max_retries(5)
///     .with_initial_delay(Duration::from_millis(500))
///     .with_max_delay(Duration::from_secs(10));
/// assert!(!policy.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Maximum number of retries before giving up (None = infinite).
    pub max_retries: Option<u32>,
    /// Initial delay between retry attempts.
    #[serde(rename = "initial_delay_ms", with = "serde_millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retry attempts.
    #[serde(rename = "max_delay_ms", with = "serde_millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f32,
}

impl ReconnectionPolicy {
    /// Creates a new reconnection policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the initial delay between retry attempts.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between retry attempts.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));

        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f32 * multiplier;

        // Saturating cast; non-finite products land on max_delay below.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Returns true if another retry should be attempted.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// A fixed number of attempts separated by a constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    #[serde(rename = "delay_ms", with = "serde_millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy of `attempts` tries spaced by `delay`.
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}
