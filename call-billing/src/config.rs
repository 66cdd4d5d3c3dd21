//! Configuration for the billing engine and reconciliation sweep

use serde::{Deserialize, Serialize};

/// Billing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Hard cap on billable session length; also sizes the upfront escrow
    /// hold (minutes)
    pub max_session_minutes: u32,

    /// Extra time after the cap before the sweep forces settlement (minutes)
    pub grace_period_minutes: u32,

    /// How long a requested call may wait for its start signal before the
    /// sweep cancels it (minutes)
    pub start_timeout_minutes: u32,

    /// Sweep interval (seconds)
    pub sweep_interval_secs: u64,

    /// Retry policy for transient store errors
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "call-billing".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            max_session_minutes: 120,
            grace_period_minutes: 10,
            start_timeout_minutes: 15,
            sweep_interval_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry with backoff for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before the error is surfaced
    pub max_attempts: u32,

    /// Base backoff between attempts (milliseconds); jittered and scaled
    /// per attempt
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(minutes) = std::env::var("BILLING_MAX_SESSION_MINUTES") {
            config.max_session_minutes = minutes
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_MAX_SESSION_MINUTES: {}", e)))?;
        }

        if let Ok(minutes) = std::env::var("BILLING_GRACE_PERIOD_MINUTES") {
            config.grace_period_minutes = minutes
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_GRACE_PERIOD_MINUTES: {}", e)))?;
        }

        if let Ok(minutes) = std::env::var("BILLING_START_TIMEOUT_MINUTES") {
            config.start_timeout_minutes = minutes
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_START_TIMEOUT_MINUTES: {}", e)))?;
        }

        if let Ok(secs) = std::env::var("BILLING_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_SWEEP_INTERVAL_SECS: {}", e)))?;
        }

        if let Ok(attempts) = std::env::var("BILLING_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_RETRY_MAX_ATTEMPTS: {}", e)))?;
        }

        if let Ok(ms) = std::env::var("BILLING_RETRY_BACKOFF_MS") {
            config.retry.backoff_ms = ms
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid BILLING_RETRY_BACKOFF_MS: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "call-billing");
        assert_eq!(config.max_session_minutes, 120);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
service_name = "call-billing"
service_version = "0.1.0"
max_session_minutes = 60
grace_period_minutes = 5
start_timeout_minutes = 10
sweep_interval_secs = 30

[retry]
max_attempts = 5
backoff_ms = 20
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.max_session_minutes, 60);
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("BILLING_GRACE_PERIOD_MINUTES", "7");
        std::env::set_var("BILLING_START_TIMEOUT_MINUTES", "20");
        std::env::set_var("BILLING_RETRY_MAX_ATTEMPTS", "6");
        std::env::set_var("BILLING_RETRY_BACKOFF_MS", "75");

        let config = Config::from_env().unwrap();
        assert_eq!(config.grace_period_minutes, 7);
        assert_eq!(config.start_timeout_minutes, 20);
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.backoff_ms, 75);
        // Untouched variables keep their defaults
        assert_eq!(config.max_session_minutes, 120);

        std::env::remove_var("BILLING_GRACE_PERIOD_MINUTES");
        std::env::remove_var("BILLING_START_TIMEOUT_MINUTES");
        std::env::remove_var("BILLING_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("BILLING_RETRY_BACKOFF_MS");
    }
}
