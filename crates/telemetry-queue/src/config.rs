// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the queue and for hosts running it.
//!
//! Values come from `TELEMETRY_*` environment variables on top of the defaults in
//! [`crate::constants`]. A value that does not parse falls back to its default with a
//! debug log; a value that parses but makes no sense (a zero batch size) is rejected by
//! `validate`.
//!
//! | Variable                              | Default                       |
//! |---------------------------------------|-------------------------------|
//! | `TELEMETRY_BATCH_SIZE`                | 10                            |
//! | `TELEMETRY_BATCH_INTERVAL_MS`         | 5000                          |
//! | `TELEMETRY_MAX_FAILURES`              | 3                             |
//! | `TELEMETRY_CIRCUIT_OPEN_DURATION_MS`  | 30000                         |
//! | `TELEMETRY_DEDUP_WINDOW_MS`           | 5000                          |
//! | `TELEMETRY_MAX_QUEUE_SIZE`            | 1000                          |
//! | `TELEMETRY_SEND_TIMEOUT_MS`           | 10000                         |
//! | `TELEMETRY_STORAGE_KEY`               | `telemetry.pending-entries`   |
//! | `TELEMETRY_COLLECTOR_URL`             | required by the relay         |
//! | `TELEMETRY_STORAGE_PATH`              | unset: ephemeral storage      |
//! | `TELEMETRY_LOG_LEVEL`                 | `info`                        |
//! | `TELEMETRY_USE_COMPRESSION`           | `false`                       |
//! | `TELEMETRY_COMPRESSION_LEVEL`         | 3                             |
//! | `TELEMETRY_PROXY_HTTPS`/`HTTPS_PROXY` | unset                         |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::constants;
use crate::error::ConfigError;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Tuning knobs of the reliability queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Entries per transport call.
    pub batch_size: usize,
    /// Scheduler tick period.
    pub batch_interval: Duration,
    /// Consecutive transport failures before the circuit opens.
    pub max_failures: u32,
    /// Cool-down before an open circuit heals.
    pub circuit_open_duration: Duration,
    /// Identical signatures inside this window collapse to one entry.
    pub dedup_window: Duration,
    /// Pending entries kept before the oldest is evicted.
    pub max_queue_size: usize,
    /// Upper bound on one transport call.
    pub send_timeout: Duration,
    /// Key under which the pending queue is persisted.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: constants::DEFAULT_BATCH_SIZE,
            batch_interval: Duration::from_millis(constants::DEFAULT_BATCH_INTERVAL_MS),
            max_failures: constants::DEFAULT_MAX_FAILURES,
            circuit_open_duration: Duration::from_millis(
                constants::DEFAULT_CIRCUIT_OPEN_DURATION_MS,
            ),
            dedup_window: Duration::from_millis(constants::DEFAULT_DEDUP_WINDOW_MS),
            max_queue_size: constants::DEFAULT_MAX_QUEUE_SIZE,
            send_timeout: Duration::from_millis(constants::DEFAULT_SEND_TIMEOUT_MS),
            storage_key: constants::DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl QueueConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_env("TELEMETRY_BATCH_SIZE", defaults.batch_size),
            batch_interval: parse_env_millis("TELEMETRY_BATCH_INTERVAL_MS", defaults.batch_interval),
            max_failures: parse_env("TELEMETRY_MAX_FAILURES", defaults.max_failures),
            circuit_open_duration: parse_env_millis(
                "TELEMETRY_CIRCUIT_OPEN_DURATION_MS",
                defaults.circuit_open_duration,
            ),
            dedup_window: parse_env_millis("TELEMETRY_DEDUP_WINDOW_MS", defaults.dedup_window),
            max_queue_size: parse_env("TELEMETRY_MAX_QUEUE_SIZE", defaults.max_queue_size),
            send_timeout: parse_env_millis("TELEMETRY_SEND_TIMEOUT_MS", defaults.send_timeout),
            storage_key: env::var("TELEMETRY_STORAGE_KEY")
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .unwrap_or(defaults.storage_key),
        };

        config.validate()?;
        Ok(config)
    }

    /// Raises zero sizes and durations to the smallest usable value.
    ///
    /// A hand-built config skips `validate`; a zero batch would "deliver" nothing forever
    /// and a zero interval cannot drive a timer.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_queue_size = self.max_queue_size.max(self.batch_size);
        self.max_failures = self.max_failures.max(1);
        self.batch_interval = self.batch_interval.max(Duration::from_millis(1));
        self.send_timeout = self.send_timeout.max(Duration::from_millis(1));
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "batch interval must be greater than 0".to_string(),
            ));
        }
        if self.max_failures == 0 {
            return Err(ConfigError::InvalidConfig(
                "max failures must be greater than 0".to_string(),
            ));
        }
        if self.max_queue_size < self.batch_size {
            return Err(ConfigError::InvalidConfig(format!(
                "max queue size ({}) must be at least the batch size ({})",
                self.max_queue_size, self.batch_size
            )));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "send timeout must be greater than 0".to_string(),
            ));
        }
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "storage key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a host process that relays entries to a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Collector endpoint receiving JSON arrays of entries.
    pub collector_url: String,
    /// sled directory for the pending queue; `None` keeps it in memory.
    pub storage_path: Option<PathBuf>,
    pub log_level: String,
    pub use_compression: bool,
    pub compression_level: i32,
    pub https_proxy: Option<String>,
    pub queue: QueueConfig,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let collector_url = env::var("TELEMETRY_COLLECTOR_URL")
            .map(|url| normalize_url(&url))
            .map_err(|_| {
                ConfigError::InvalidConfig("TELEMETRY_COLLECTOR_URL must be set".to_string())
            })?;
        let storage_path = env::var("TELEMETRY_STORAGE_PATH")
            .ok()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let log_level = env::var("TELEMETRY_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or_else(|_| "info".to_string());
        let use_compression = env::var("TELEMETRY_USE_COMPRESSION")
            .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        let compression_level = parse_env("TELEMETRY_COMPRESSION_LEVEL", 3);
        let https_proxy = env::var("TELEMETRY_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        let config = Self {
            collector_url,
            storage_path,
            log_level,
            use_compression,
            compression_level,
            https_proxy,
            queue: QueueConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "TELEMETRY_COLLECTOR_URL cannot be empty".to_string(),
            ));
        }

        if let Err(e) = reqwest::Url::parse(&self.collector_url) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid TELEMETRY_COLLECTOR_URL '{}': {}",
                self.collector_url, e
            )));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        self.queue.validate()
    }
}

/// Normalize a URL by ensuring it has a valid protocol
///
/// If the URL doesn't start with http:// or https://, adds https:// prefix
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                debug!("Invalid value for {}: {:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_millis(name: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_env(name, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 14] = [
        "TELEMETRY_BATCH_SIZE",
        "TELEMETRY_BATCH_INTERVAL_MS",
        "TELEMETRY_MAX_FAILURES",
        "TELEMETRY_CIRCUIT_OPEN_DURATION_MS",
        "TELEMETRY_DEDUP_WINDOW_MS",
        "TELEMETRY_MAX_QUEUE_SIZE",
        "TELEMETRY_SEND_TIMEOUT_MS",
        "TELEMETRY_STORAGE_KEY",
        "TELEMETRY_COLLECTOR_URL",
        "TELEMETRY_STORAGE_PATH",
        "TELEMETRY_LOG_LEVEL",
        "TELEMETRY_USE_COMPRESSION",
        "TELEMETRY_PROXY_HTTPS",
        "HTTPS_PROXY",
    ];

    fn clear_env() {
        for key in VARS {
            env::remove_var(key);
        }
        env::remove_var("TELEMETRY_COMPRESSION_LEVEL");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_interval, Duration::from_secs(5));
        assert_eq!(config.dedup_window, Duration::from_millis(5_000));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let config = QueueConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConfig(
                "batch size must be greater than 0".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_queue_smaller_than_batch() {
        let config = QueueConfig {
            batch_size: 20,
            max_queue_size: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_durations() {
        for config in [
            QueueConfig {
                batch_interval: Duration::ZERO,
                ..Default::default()
            },
            QueueConfig {
                send_timeout: Duration::ZERO,
                ..Default::default()
            },
            QueueConfig {
                max_failures: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be invalid");
        }
    }

    #[test]
    #[serial]
    fn test_queue_config_from_env_defaults() {
        clear_env();
        assert_eq!(QueueConfig::from_env().unwrap(), QueueConfig::default());
    }

    #[test]
    #[serial]
    fn test_queue_config_from_env_overrides() {
        clear_env();
        env::set_var("TELEMETRY_BATCH_SIZE", "25");
        env::set_var("TELEMETRY_BATCH_INTERVAL_MS", "1000");
        env::set_var("TELEMETRY_MAX_FAILURES", "5");
        env::set_var("TELEMETRY_CIRCUIT_OPEN_DURATION_MS", "60000");
        env::set_var("TELEMETRY_DEDUP_WINDOW_MS", " 2500 ");
        env::set_var("TELEMETRY_STORAGE_KEY", "dashboard.errors");

        let config = QueueConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_interval, Duration::from_secs(1));
        assert_eq!(config.max_failures, 5);
        assert_eq!(config.circuit_open_duration, Duration::from_secs(60));
        assert_eq!(config.dedup_window, Duration::from_millis(2_500));
        assert_eq!(config.storage_key, "dashboard.errors");
    }

    #[test]
    #[serial]
    fn test_unparseable_values_fall_back_to_defaults() {
        clear_env();
        env::set_var("TELEMETRY_BATCH_SIZE", "ten");
        env::set_var("TELEMETRY_SEND_TIMEOUT_MS", "-1");

        let config = QueueConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.batch_size, constants::DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.send_timeout,
            Duration::from_millis(constants::DEFAULT_SEND_TIMEOUT_MS)
        );
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        env::set_var("TELEMETRY_BATCH_SIZE", "0");

        let result = QueueConfig::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_clamped_raises_zero_values() {
        let config = QueueConfig {
            batch_size: 0,
            batch_interval: Duration::ZERO,
            max_failures: 0,
            max_queue_size: 0,
            send_timeout: Duration::ZERO,
            ..Default::default()
        }
        .clamped();

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_queue_size, 1);
        assert_eq!(config.max_failures, 1);
        assert_eq!(config.batch_interval, Duration::from_millis(1));
        assert_eq!(config.send_timeout, Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_clamped_keeps_valid_config() {
        assert_eq!(QueueConfig::default().clamped(), QueueConfig::default());
    }

    #[test]
    #[serial]
    fn test_relay_config_requires_collector_url() {
        clear_env();
        assert_eq!(
            RelayConfig::from_env(),
            Err(ConfigError::InvalidConfig(
                "TELEMETRY_COLLECTOR_URL must be set".to_string()
            ))
        );
    }

    #[test]
    #[serial]
    fn test_relay_config_from_env() {
        clear_env();
        env::set_var("TELEMETRY_COLLECTOR_URL", " collector.example.com/api/logs ");
        env::set_var("TELEMETRY_STORAGE_PATH", "/var/lib/telemetry");
        env::set_var("TELEMETRY_LOG_LEVEL", "DEBUG");
        env::set_var("TELEMETRY_USE_COMPRESSION", "true");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");

        let config = RelayConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.collector_url, "https://collector.example.com/api/logs");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/telemetry")));
        assert_eq!(config.log_level, "debug");
        assert!(config.use_compression);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    #[serial]
    fn test_relay_config_prefers_explicit_proxy() {
        clear_env();
        env::set_var("TELEMETRY_COLLECTOR_URL", "http://localhost:8080/logs");
        env::set_var("TELEMETRY_PROXY_HTTPS", "http://explicit:3128");
        env::set_var("HTTPS_PROXY", "http://ambient:3128");

        let config = RelayConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.collector_url, "http://localhost:8080/logs");
        assert_eq!(config.https_proxy.as_deref(), Some("http://explicit:3128"));
    }

    #[test]
    #[serial]
    fn test_relay_config_rejects_unparseable_collector_url() {
        clear_env();
        env::set_var("TELEMETRY_COLLECTOR_URL", "bad host/api");

        let result = RelayConfig::from_env();
        clear_env();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("TELEMETRY_COLLECTOR_URL")
        ));
    }

    #[test]
    #[serial]
    fn test_relay_config_rejects_unknown_log_level() {
        clear_env();
        env::set_var("TELEMETRY_COLLECTOR_URL", "http://localhost:8080/logs");
        env::set_var("TELEMETRY_LOG_LEVEL", "verbose");

        let result = RelayConfig::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
        assert_eq!(normalize_url("  https://example.com "), "https://example.com");
    }
}
