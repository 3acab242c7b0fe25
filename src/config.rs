//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for local development. A `.env` file is honoured if present.
//!
//! # Deadline Behaviour
//!
//! - `REQUEST_TIMEOUT_MS`: Deadline applied to every request (default: 3000)
//! - `WATCHER_ENABLED`: Sever connections whose handler misses the deadline
//!   (default: true)
//! - `INTERIM_FLUSH`: Slow-query handler flushes a "starting" line before
//!   working, which commits a 200 status early (default: false)
//! - `ABORT_GRACE_MS`: How long a severed connection may drain its timeout
//!   response before the socket is dropped (default: 1000)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected 'pretty' or 'json')")),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8085)
    pub port: u16,

    /// Maximum wait for open connections on shutdown (default: 10 seconds)
    pub shutdown_grace: Duration,

    // =========================================================================
    // Deadline Configuration
    // =========================================================================
    /// Deadline applied uniformly to every request (default: 3 seconds)
    pub request_timeout: Duration,

    /// Run the hijack-and-abort watcher alongside each handler
    pub watcher_enabled: bool,

    /// Slow-query handler writes and flushes an interim line before working
    pub interim_flush: bool,

    /// Drain window for a connection severed after a timeout (default: 1 second)
    pub abort_grace: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level filter (e.g., "info", "debug", "request_deadline=trace")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value cannot be parsed or fails
    /// validation (e.g., a zero request timeout).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8085)?,
            shutdown_grace: Duration::from_secs(Self::parse_env("SHUTDOWN_GRACE_SECS", 10)?),

            // Deadline
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 3000)?),
            watcher_enabled: Self::parse_env("WATCHER_ENABLED", true)?,
            interim_flush: Self::parse_env("INTERIM_FLUSH", false)?,
            abort_grace: Duration::from_millis(Self::parse_env("ABORT_GRACE_MS", 1000)?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    fn validate(&self) -> AppResult<()> {
        if self.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.abort_grace.is_zero() {
            return Err(AppError::ConfigError(
                "ABORT_GRACE_MS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8085,
            shutdown_grace: Duration::from_secs(10),
            // Deadline
            request_timeout: Duration::from_secs(3),
            watcher_enabled: true,
            interim_flush: false,
            abort_grace: Duration::from_secs(1),
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8085);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert!(config.watcher_enabled);
        assert!(!config.interim_flush);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8085,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:8085");
    }

    #[test]
    fn test_metrics_addr_disabled_on_zero_port() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(!config.metrics_enabled());
        assert!(config.metrics_addr().is_none());

        let config = Config::default();
        assert_eq!(config.metrics_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = Config {
            request_timeout: Duration::ZERO,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_zero_abort_grace() {
        let config = Config {
            abort_grace: Duration::ZERO,
            ..Config::default()
        };

        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("ABORT_GRACE_MS")
        );
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
