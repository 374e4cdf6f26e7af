//! Application configuration.
//!
//! This module provides configuration for the queue, worker pool, resilience
//! manager and the Genius fetcher, including concurrency and retry limits,
//! checkpointing cadence, rate limiting, and on-disk data paths.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the lyrics pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Execution settings
    /// Number of workers in the pool; also the global concurrency ceiling.
    pub worker_count: usize,
    /// Maximum retries per task on top of the initial attempt.
    pub max_retries: u32,
    /// Delay before a failed task re-enters the queue.
    pub retry_delay: Duration,

    // Resilience settings
    /// Unique completions between periodic checkpoints.
    pub checkpoint_interval: u64,
    /// Failure-rate threshold (0.0-1.0) for the background monitor warning.
    pub error_threshold: f64,
    /// Cadence of the background error-rate monitor.
    pub monitor_interval: Duration,
    /// Bounded wait for in-flight tasks during shutdown.
    pub shutdown_grace: Duration,

    // Fetcher settings
    /// Outbound requests allowed per rate-limit window, shared by all workers.
    pub rate_limit_requests: u32,
    /// Length of the rate-limit window.
    pub rate_limit_window: Duration,
    /// Genius API key; required when running the real fetcher.
    pub genius_api_key: Option<String>,

    // Storage settings
    /// Root directory for the task store, result store, checkpoints and logs.
    pub data_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            checkpoint_interval: 10,
            error_threshold: 0.1,
            monitor_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            rate_limit_requests: 10,
            rate_limit_window: Duration::from_secs(60),
            genius_api_key: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LYRICFORGE_WORKER_COUNT`: Worker pool size (default: 4)
    /// - `LYRICFORGE_MAX_RETRIES`: Retries per task (default: 3)
    /// - `LYRICFORGE_RETRY_DELAY_MS`: Retry delay in milliseconds (default: 5000)
    /// - `LYRICFORGE_CHECKPOINT_INTERVAL`: Completions between checkpoints (default: 10)
    /// - `LYRICFORGE_ERROR_THRESHOLD`: Monitor failure-rate threshold (default: 0.1)
    /// - `LYRICFORGE_MONITOR_INTERVAL_SECS`: Monitor cadence (default: 60)
    /// - `LYRICFORGE_SHUTDOWN_GRACE_SECS`: Shutdown grace period (default: 5)
    /// - `LYRICFORGE_RATE_LIMIT_REQUESTS`: Requests per window (default: 10)
    /// - `LYRICFORGE_RATE_LIMIT_WINDOW_SECS`: Window length (default: 60)
    /// - `GENIUS_API_KEY`: Genius API key (optional here, required to fetch)
    /// - `LYRICFORGE_DATA_DIR`: Data directory (default: ./data)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LYRICFORGE_WORKER_COUNT") {
            config.worker_count = parse_env_value(&val, "LYRICFORGE_WORKER_COUNT")?;
        }

        if let Ok(val) = std::env::var("LYRICFORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "LYRICFORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("LYRICFORGE_RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "LYRICFORGE_RETRY_DELAY_MS")?;
            config.retry_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("LYRICFORGE_CHECKPOINT_INTERVAL") {
            config.checkpoint_interval = parse_env_value(&val, "LYRICFORGE_CHECKPOINT_INTERVAL")?;
        }

        if let Ok(val) = std::env::var("LYRICFORGE_ERROR_THRESHOLD") {
            config.error_threshold = parse_env_value(&val, "LYRICFORGE_ERROR_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("LYRICFORGE_MONITOR_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "LYRICFORGE_MONITOR_INTERVAL_SECS")?;
            config.monitor_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LYRICFORGE_SHUTDOWN_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "LYRICFORGE_SHUTDOWN_GRACE_SECS")?;
            config.shutdown_grace = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("LYRICFORGE_RATE_LIMIT_REQUESTS") {
            config.rate_limit_requests = parse_env_value(&val, "LYRICFORGE_RATE_LIMIT_REQUESTS")?;
        }

        if let Ok(val) = std::env::var("LYRICFORGE_RATE_LIMIT_WINDOW_SECS") {
            let secs: u64 = parse_env_value(&val, "LYRICFORGE_RATE_LIMIT_WINDOW_SECS")?;
            config.rate_limit_window = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GENIUS_API_KEY") {
            if !val.is_empty() {
                config.genius_api_key = Some(val);
            }
        }

        if let Ok(val) = std::env::var("LYRICFORGE_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(ConfigError::ValidationFailed(
                "error_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_requests == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit_requests must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rate_limit_window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the durable task-store database.
    pub fn task_db_path(&self) -> PathBuf {
        self.data_dir.join("queue.sqlite")
    }

    /// Path of the lyrics result-store database.
    pub fn lyrics_db_path(&self) -> PathBuf {
        self.data_dir.join("lyrics.sqlite")
    }

    /// Directory holding checkpoint documents.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory holding the per-day audit log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Builder method to set the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder method to set the retry limit.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Builder method to set the checkpoint cadence.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Builder method to set the monitor error threshold.
    pub fn with_error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Builder method to set the monitor cadence.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Builder method to set the rate limit.
    pub fn with_rate_limit(mut self, requests: u32, window: Duration) -> Self {
        self.rate_limit_requests = requests;
        self.rate_limit_window = window;
        self
    }

    /// Builder method to set the Genius API key.
    pub fn with_genius_api_key(mut self, key: impl Into<String>) -> Self {
        self.genius_api_key = Some(key.into());
        self
    }

    /// Builder method to set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.checkpoint_interval, 10);
        assert!((config.error_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.rate_limit_requests, 10);
        assert!(config.genius_api_key.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = AppConfig::new()
            .with_worker_count(2)
            .with_max_retries(1)
            .with_retry_delay(Duration::from_millis(50))
            .with_checkpoint_interval(5)
            .with_error_threshold(0.25)
            .with_shutdown_grace(Duration::from_secs(1))
            .with_rate_limit(100, Duration::from_secs(10))
            .with_genius_api_key("key")
            .with_data_dir("/tmp/lyricforge");

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.retry_delay, Duration::from_millis(50));
        assert_eq!(config.checkpoint_interval, 5);
        assert!((config.error_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit_requests, 100);
        assert_eq!(config.genius_api_key.as_deref(), Some("key"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lyricforge"));
    }

    #[test]
    fn test_derived_paths() {
        let config = AppConfig::default().with_data_dir("/var/lyricforge");
        assert_eq!(
            config.task_db_path(),
            PathBuf::from("/var/lyricforge/queue.sqlite")
        );
        assert_eq!(
            config.lyrics_db_path(),
            PathBuf::from("/var/lyricforge/lyrics.sqlite")
        );
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("/var/lyricforge/checkpoints")
        );
        assert_eq!(config.log_dir(), PathBuf::from("/var/lyricforge/logs"));
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_workers() {
        let config = AppConfig::default().with_worker_count(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("worker_count"));
    }

    #[test]
    fn test_validation_zero_checkpoint_interval() {
        let config = AppConfig::default().with_checkpoint_interval(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("checkpoint_interval"));
    }

    #[test]
    fn test_validation_invalid_error_threshold() {
        let config = AppConfig::default().with_error_threshold(1.5);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("error_threshold"));
    }

    #[test]
    fn test_validation_zero_rate_limit() {
        let config = AppConfig::default().with_rate_limit(0, Duration::from_secs(60));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("rate_limit_requests"));
    }

    #[test]
    fn test_parse_env_value_failure_names_key() {
        let result: Result<usize, _> = parse_env_value("not-a-number", "SOME_KEY");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("SOME_KEY"));
    }
}
