//! Configuration for the event shipper client.
//!
//! Settings come from environment variables via [`Config::from_env`], or are
//! built in code with [`Config::new`] and the `with_*` overrides.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::batch::{BatchConfig, FailurePolicy};
use crate::transport::RetryConfig;

/// Default API URL
const DEFAULT_URL: &str = "http://localhost:8080";

/// Default batch size (number of events per request)
const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Default flush interval in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum flush interval to ensure reasonable data freshness
const MAX_FLUSH_INTERVAL_MS: u64 = 300_000;

/// Default number of events a batch may hold before dropping the oldest
const DEFAULT_MAX_CAPACITY: usize = 10_000;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Configuration for a [`Client`](crate::Client).
///
/// All settings can be configured via environment variables:
/// - `EVENT_SHIPPER_URL`: API base URL (default: http://localhost:8080)
/// - `EVENT_SHIPPER_TOKEN`: bearer token (required)
/// - `EVENT_SHIPPER_ORG_ID`: organization the token acts for (optional)
/// - `EVENT_SHIPPER_BATCHING`: `true`/`false` (default: true)
/// - `EVENT_SHIPPER_BATCH_SIZE`: events per request (default: 1000)
/// - `EVENT_SHIPPER_FLUSH_INTERVAL_MS`: milliseconds before a partial batch is sent (default: 1000)
/// - `EVENT_SHIPPER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `EVENT_SHIPPER_MAX_ATTEMPTS`: attempts per request including the first (default: 3)
/// - `EVENT_SHIPPER_RETRY_BASE_DELAY_MS`: first backoff delay (default: 500)
/// - `EVENT_SHIPPER_FAILURE_POLICY`: `drop` or `requeue` (default: drop)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the API, without trailing slash
    pub url: String,

    /// Bearer token sent with every request
    pub token: String,

    /// Organization ID header value, if any
    pub org_id: Option<String>,

    /// Buffer events per dataset instead of sending each `ingest` call directly
    pub batching: bool,

    /// Number of events to accumulate before flushing a batch
    pub batch_size: usize,

    /// Duration to wait before flushing buffered events, even if batch size not reached
    pub flush_interval: Duration,

    /// Maximum number of events held per batch
    pub max_capacity: usize,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Attempts per request, including the first
    pub max_attempts: u32,

    /// Backoff delay before the first retry; doubles on each attempt
    pub retry_base_delay: Duration,

    /// What happens to events of a failed flush
    pub failure_policy: FailurePolicy,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {env_var}: {message}")]
    Invalid { env_var: String, message: String },

    #[error("Configuration error: {0} must be set")]
    Missing(String),
}

impl Config {
    /// Create a configuration with defaults and the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `EVENT_SHIPPER_TOKEN` is not set
    /// - a numeric variable is not a valid number or exceeds limits
    /// - `EVENT_SHIPPER_FAILURE_POLICY` is not `drop` or `requeue`
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use event_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("API URL: {}", config.url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = env::var("EVENT_SHIPPER_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("EVENT_SHIPPER_TOKEN".to_string()))?;

        let url = env::var("EVENT_SHIPPER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

        let org_id = env::var("EVENT_SHIPPER_ORG_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let batching = match env::var("EVENT_SHIPPER_BATCHING") {
            Ok(value) => parse_bool("EVENT_SHIPPER_BATCHING", &value)?,
            Err(_) => true,
        };

        let batch_size = Self::parse_batch_size()?;
        let flush_interval = Duration::from_millis(Self::parse_flush_interval()?);

        let request_timeout = Duration::from_secs(parse_number(
            "EVENT_SHIPPER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        let max_attempts = parse_number("EVENT_SHIPPER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(invalid(
                "EVENT_SHIPPER_MAX_ATTEMPTS",
                "max attempts must be greater than 0",
            ));
        }

        let retry_base_delay = Duration::from_millis(parse_number(
            "EVENT_SHIPPER_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
        )?);

        let failure_policy = match env::var("EVENT_SHIPPER_FAILURE_POLICY") {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "drop" => FailurePolicy::Drop,
                "requeue" => FailurePolicy::Requeue,
                other => {
                    return Err(invalid(
                        "EVENT_SHIPPER_FAILURE_POLICY",
                        format!("'{}' is not one of: drop, requeue", other),
                    ))
                }
            },
            Err(_) => FailurePolicy::default(),
        };

        Ok(Self {
            url: normalize_url(&url),
            token,
            org_id,
            batching,
            batch_size,
            flush_interval,
            max_capacity: DEFAULT_MAX_CAPACITY,
            request_timeout,
            max_attempts,
            retry_base_delay,
            failure_policy,
        })
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "EVENT_SHIPPER_BATCH_SIZE";
        let batch_size = parse_number(env_var, DEFAULT_BATCH_SIZE)?;

        if batch_size == 0 {
            return Err(invalid(env_var, "batch size must be greater than 0"));
        }

        if batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                env_var,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        Ok(batch_size)
    }

    /// Parse flush interval from environment variable with validation.
    fn parse_flush_interval() -> Result<u64, ConfigError> {
        let env_var = "EVENT_SHIPPER_FLUSH_INTERVAL_MS";
        let interval = parse_number(env_var, DEFAULT_FLUSH_INTERVAL_MS)?;

        if interval == 0 {
            return Err(invalid(env_var, "flush interval must be greater than 0"));
        }

        if interval > MAX_FLUSH_INTERVAL_MS {
            return Err(invalid(
                env_var,
                format!(
                    "flush interval {} exceeds maximum ({}ms)",
                    interval, MAX_FLUSH_INTERVAL_MS
                ),
            ));
        }

        Ok(interval)
    }

    pub fn with_url(mut self, url: impl AsRef<str>) -> Self {
        self.url = normalize_url(url.as_ref());
        self
    }

    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_batching(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Batch queue settings derived from this configuration.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.batch_size.max(1),
            flush_interval: self.flush_interval,
            max_capacity: self.max_capacity.max(self.batch_size),
            failure_policy: self.failure_policy,
        }
    }

    /// Transport retry settings derived from this configuration.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: self.retry_base_delay,
            ..RetryConfig::default()
        }
    }
}

impl Default for Config {
    /// Create a default configuration with an empty token.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            token: String::new(),
            org_id: None,
            batching: true,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_capacity: DEFAULT_MAX_CAPACITY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn invalid(env_var: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        env_var: env_var.to_string(),
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| invalid(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(env_var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(env_var, format!("'{}' is not a boolean", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests in this module mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "EVENT_SHIPPER_URL",
        "EVENT_SHIPPER_TOKEN",
        "EVENT_SHIPPER_ORG_ID",
        "EVENT_SHIPPER_BATCHING",
        "EVENT_SHIPPER_BATCH_SIZE",
        "EVENT_SHIPPER_FLUSH_INTERVAL_MS",
        "EVENT_SHIPPER_REQUEST_TIMEOUT_SECS",
        "EVENT_SHIPPER_MAX_ATTEMPTS",
        "EVENT_SHIPPER_RETRY_BASE_DELAY_MS",
        "EVENT_SHIPPER_FAILURE_POLICY",
    ];

    fn clean_env() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|var| EnvGuard::remove(var)).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.url, "http://localhost:8080");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 3);
        assert!(config.batching);
        assert_eq!(config.failure_policy, FailurePolicy::Drop);
    }

    #[test]
    fn test_config_from_env_requires_token() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref var) if var == "EVENT_SHIPPER_TOKEN"));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.url, "http://localhost:8080");
        assert_eq!(config.token, "secret");
        assert!(config.org_id.is_none());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.flush_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _g1 = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _g2 = EnvGuard::set("EVENT_SHIPPER_URL", "http://custom:9000/");
        let _g3 = EnvGuard::set("EVENT_SHIPPER_ORG_ID", "acme");
        let _g4 = EnvGuard::set("EVENT_SHIPPER_BATCH_SIZE", "200");
        let _g5 = EnvGuard::set("EVENT_SHIPPER_FLUSH_INTERVAL_MS", "250");
        let _g6 = EnvGuard::set("EVENT_SHIPPER_BATCHING", "false");
        let _g7 = EnvGuard::set("EVENT_SHIPPER_FAILURE_POLICY", "requeue");
        let _g8 = EnvGuard::set("EVENT_SHIPPER_MAX_ATTEMPTS", "5");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.url, "http://custom:9000"); // Trailing slash removed
        assert_eq!(config.org_id.as_deref(), Some("acme"));
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert!(!config.batching);
        assert_eq!(config.failure_policy, FailurePolicy::Requeue);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_invalid_batch_size() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _guard = EnvGuard::set("EVENT_SHIPPER_BATCH_SIZE", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("not a valid number"));
    }

    #[test]
    fn test_zero_batch_size() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _guard = EnvGuard::set("EVENT_SHIPPER_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _guard = EnvGuard::set("EVENT_SHIPPER_BATCH_SIZE", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_flush_interval_exceeds_max() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _guard = EnvGuard::set("EVENT_SHIPPER_FLUSH_INTERVAL_MS", "999999");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_unknown_failure_policy() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _clean = clean_env();
        let _token = EnvGuard::set("EVENT_SHIPPER_TOKEN", "secret");
        let _guard = EnvGuard::set("EVENT_SHIPPER_FAILURE_POLICY", "retry-forever");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("EVENT_SHIPPER_FAILURE_POLICY"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::new("token")
            .with_url("https://ingest.example.com/")
            .with_batch_size(10)
            .with_max_attempts(0)
            .with_retry_base_delay(Duration::from_millis(5));

        assert_eq!(config.url, "https://ingest.example.com");
        assert_eq!(config.batch_config().max_batch_size, 10);
        assert_eq!(config.retry_config().max_attempts, 1);
        assert_eq!(config.retry_config().base_delay, Duration::from_millis(5));
    }

    #[test]
    fn test_config_error_display() {
        let error = invalid("TEST_VAR", "test error");
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error = ConfigError::Missing("TEST_VAR".to_string());
        assert_eq!(format!("{}", error), "Configuration error: TEST_VAR must be set");
    }
}
