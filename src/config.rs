//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Shared Store
//!
//! - `REDIS_HOST`: `host:port` of the Redis server (default: `redis:6379`)
//! - `REDIS_DB`: Logical database (default: 0)
//! - `REDIS_PASSWORD`: Optional AUTH password
//! - `STORE_OPERATION_TIMEOUT_MS`: Upper bound for any single store call (default: 500)
//!
//! # Admission Policies
//!
//! - `IDEMPOTENCY_FAILURE_POLICY`: `open` (default) or `closed`
//! - `RATE_LIMIT_FAILURE_POLICY`: `closed` (default) or `open`
//! - `RATE_LIMIT_MAX_REQUESTS` / `RATE_LIMIT_WINDOW_SECS`: Fixed-window quota
//!   for the `topup` action (default: 5 per 60 seconds)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::{FailurePolicy, IdempotencyConfig};
use crate::store::RedisConfig;

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Shared Store Configuration
    // =========================================================================
    /// Redis `host:port` (default: "redis:6379")
    pub redis_host: String,

    /// Redis logical database (default: 0)
    pub redis_db: i64,

    /// Redis password (optional)
    pub redis_password: Option<String>,

    /// Timeout for the startup connect and PING (default: 5 seconds)
    pub redis_connect_timeout: Duration,

    /// Upper bound for each store call made on behalf of a request (default: 500ms).
    /// A client `X-Request-Timeout` can only shorten it.
    pub store_operation_timeout: Duration,

    // =========================================================================
    // Idempotency Gate Configuration
    // =========================================================================
    /// Lifetime of a stored response (default: 24 hours)
    pub idempotency_ttl: Duration,

    /// Lifetime of an in-flight reservation (default: 30 seconds)
    pub idempotency_reservation_ttl: Duration,

    /// How long a duplicate waits for the in-flight original (default: 5 seconds)
    pub idempotency_wait: Duration,

    /// Pause between lookups while waiting (default: 50ms)
    pub idempotency_poll_interval: Duration,

    /// Largest response body that is stored for replay (default: 1MB)
    pub idempotency_max_body_bytes: usize,

    /// Behavior when the store fails (default: open)
    pub idempotency_failure_policy: FailurePolicy,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests admitted per window per client (default: 5)
    pub rate_limit_max_requests: u64,

    /// Fixed window length (default: 60 seconds)
    pub rate_limit_window: Duration,

    /// Behavior when the store fails (default: closed)
    pub rate_limit_failure_policy: FailurePolicy,

    /// Request body bytes kept per violation audit entry (default: 1KB)
    pub audit_body_max_bytes: usize,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let redis = RedisConfig::default();
        let idempotency = IdempotencyConfig::default();

        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024,
            redis_host: redis.host,
            redis_db: redis.db,
            redis_password: redis.password,
            redis_connect_timeout: redis.connect_timeout,
            store_operation_timeout: idempotency.store_timeout,
            idempotency_ttl: idempotency.record_ttl,
            idempotency_reservation_ttl: idempotency.reservation_ttl,
            idempotency_wait: idempotency.in_flight_wait,
            idempotency_poll_interval: idempotency.poll_interval,
            idempotency_max_body_bytes: idempotency.max_cacheable_bytes,
            idempotency_failure_policy: idempotency.failure_policy,
            rate_limit_max_requests: 5,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_failure_policy: FailurePolicy::Closed,
            audit_body_max_bytes: 1024,
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or validate.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            max_request_body_size: Self::parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,

            // Shared store
            redis_host: env::var("REDIS_HOST").unwrap_or(defaults.redis_host),
            redis_db: Self::parse_env("REDIS_DB", defaults.redis_db)?,
            redis_password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            redis_connect_timeout: Self::parse_millis(
                "REDIS_CONNECT_TIMEOUT_MS",
                defaults.redis_connect_timeout,
            )?,
            store_operation_timeout: Self::parse_millis(
                "STORE_OPERATION_TIMEOUT_MS",
                defaults.store_operation_timeout,
            )?,

            // Idempotency gate
            idempotency_ttl: Self::parse_secs("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
            idempotency_reservation_ttl: Self::parse_secs(
                "IDEMPOTENCY_RESERVATION_TTL_SECS",
                defaults.idempotency_reservation_ttl,
            )?,
            idempotency_wait: Self::parse_millis("IDEMPOTENCY_WAIT_MS", defaults.idempotency_wait)?,
            idempotency_poll_interval: Self::parse_millis(
                "IDEMPOTENCY_POLL_INTERVAL_MS",
                defaults.idempotency_poll_interval,
            )?,
            idempotency_max_body_bytes: Self::parse_env(
                "IDEMPOTENCY_MAX_BODY_BYTES",
                defaults.idempotency_max_body_bytes,
            )?,
            idempotency_failure_policy: Self::parse_env(
                "IDEMPOTENCY_FAILURE_POLICY",
                defaults.idempotency_failure_policy,
            )?,

            // Rate limiting
            rate_limit_max_requests: Self::parse_env(
                "RATE_LIMIT_MAX_REQUESTS",
                defaults.rate_limit_max_requests,
            )?,
            rate_limit_window: Self::parse_secs(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window,
            )?,
            rate_limit_failure_policy: Self::parse_env(
                "RATE_LIMIT_FAILURE_POLICY",
                defaults.rate_limit_failure_policy,
            )?,
            audit_body_max_bytes: Self::parse_env(
                "AUDIT_BODY_MAX_BYTES",
                defaults.audit_body_max_bytes,
            )?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.store_operation_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_OPERATION_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_max_requests == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_MAX_REQUESTS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        // A reservation that expires while the wait is still running would let a
        // waiter execute the handler a second time.
        if self.idempotency_reservation_ttl <= self.idempotency_wait {
            return Err(AppError::ConfigError(format!(
                "IDEMPOTENCY_RESERVATION_TTL_SECS ({:?}) must exceed IDEMPOTENCY_WAIT_MS ({:?})",
                self.idempotency_reservation_ttl, self.idempotency_wait
            )));
        }

        self.idempotency()
            .validate()
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection settings for the shared store.
    pub fn redis(&self) -> RedisConfig {
        RedisConfig {
            host: self.redis_host.clone(),
            db: self.redis_db,
            password: self.redis_password.clone(),
            connect_timeout: self.redis_connect_timeout,
        }
    }

    /// Idempotency gate settings.
    pub fn idempotency(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            record_ttl: self.idempotency_ttl,
            reservation_ttl: self.idempotency_reservation_ttl,
            in_flight_wait: self.idempotency_wait,
            poll_interval: self.idempotency_poll_interval,
            max_cacheable_bytes: self.idempotency_max_body_bytes,
            store_timeout: self.store_operation_timeout,
            failure_policy: self.idempotency_failure_policy,
        }
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_millis(name: &str, default: Duration) -> AppResult<Duration> {
        match env::var(name) {
            Ok(_) => Ok(Duration::from_millis(Self::parse_env::<u64>(name, 0)?)),
            Err(_) => Ok(default),
        }
    }

    fn parse_secs(name: &str, default: Duration) -> AppResult<Duration> {
        match env::var(name) {
            Ok(_) => Ok(Duration::from_secs(Self::parse_env::<u64>(name, 0)?)),
            Err(_) => Ok(default),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idempotency_failure_policy, FailurePolicy::Open);
        assert_eq!(config.rate_limit_failure_policy, FailurePolicy::Closed);
        assert_eq!(config.redis_host, "redis:6379");
    }

    #[test]
    fn test_server_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = Config {
            rate_limit_max_requests: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_reservation_must_outlive_wait() {
        let config = Config {
            idempotency_reservation_ttl: Duration::from_secs(2),
            idempotency_wait: Duration::from_secs(5),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = Config {
            idempotency_poll_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_metrics_addr() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
        assert_eq!(Config::default().metrics_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_redis_and_idempotency_views() {
        let config = Config {
            redis_db: 3,
            store_operation_timeout: Duration::from_millis(250),
            ..Config::default()
        };
        assert_eq!(config.redis().url(), "redis://redis:6379/3");
        assert_eq!(
            config.idempotency().store_timeout,
            Duration::from_millis(250)
        );
    }
}
