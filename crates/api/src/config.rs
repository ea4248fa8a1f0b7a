//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use purchase::{OrchestratorConfig, RetryPolicy};
use thiserror::Error;

/// Configuration that parsed but cannot run safely.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "STALE_PURCHASE_SECS ({stale_after:?}) must exceed the fulfillment timeout plus \
         compensation backoff ({in_flight:?})"
    )]
    StaleWindowTooShort {
        stale_after: Duration,
        in_flight: Duration,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" | "plain" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
/// - `DATABASE_URL`: PostgreSQL URL; unset runs the in-memory ledger
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `FULFILLMENT_URL`: certificate service endpoint; unset uses the in-memory provider
/// - `FULFILLMENT_TIMEOUT_MS`: per-call bound (default: `10000`)
/// - `COMPENSATION_MAX_ATTEMPTS` (default: `5`)
/// - `COMPENSATION_INITIAL_BACKOFF_MS` (default: `100`)
/// - `COMPENSATION_MAX_BACKOFF_MS` (default: `2000`)
/// - `STALE_PURCHASE_SECS`: age after which `processing` purchases are refunded (default: `900`);
///   must exceed the fulfillment timeout plus the compensation backoff
/// - `STALE_SWEEP_INTERVAL_SECS`: how often to look for them (default: `60`)
/// - `CATALOG_FILE`: JSON catalog; unset starts with an empty catalog
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub fulfillment_url: Option<String>,
    pub fulfillment_timeout: Duration,
    pub compensation: RetryPolicy,
    pub stale_purchase_after: Duration,
    pub stale_sweep_interval: Duration,
    pub catalog_file: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| f.parse().ok())
                .unwrap_or(defaults.log_format),
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            fulfillment_url: non_empty("FULFILLMENT_URL"),
            fulfillment_timeout: parse("FULFILLMENT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.fulfillment_timeout),
            compensation: RetryPolicy {
                max_attempts: lookup("COMPENSATION_MAX_ATTEMPTS")
                    .and_then(|v| v.parse().ok())
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.compensation.max_attempts),
                initial_backoff: parse("COMPENSATION_INITIAL_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.compensation.initial_backoff),
                max_backoff: parse("COMPENSATION_MAX_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.compensation.max_backoff),
            },
            stale_purchase_after: parse("STALE_PURCHASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_purchase_after),
            stale_sweep_interval: parse("STALE_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_sweep_interval),
            catalog_file: non_empty("CATALOG_FILE").map(PathBuf::from),
        }
    }

    /// Rejects settings that let the stale sweep refund a purchase whose
    /// fulfillment call or compensation retries may still be running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_flight = self
            .fulfillment_timeout
            .saturating_add(self.compensation.total_backoff());
        if self.stale_purchase_after <= in_flight {
            return Err(ConfigError::StaleWindowTooShort {
                stale_after: self.stale_purchase_after,
                in_flight,
            });
        }
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fulfillment_timeout: self.fulfillment_timeout,
            retry: self.compensation,
            ..OrchestratorConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            fulfillment_url: None,
            fulfillment_timeout: Duration::from_millis(10_000),
            compensation: RetryPolicy::default(),
            stale_purchase_after: Duration::from_secs(900),
            stale_sweep_interval: Duration::from_secs(60),
            catalog_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert_eq!(config.fulfillment_timeout, Duration::from_secs(10));
        assert_eq!(config.compensation.max_attempts, 5);
        assert_eq!(config.stale_purchase_after, Duration::from_secs(900));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_empty_lookup_matches_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert!(config.fulfillment_url.is_none());
        assert!(config.catalog_file.is_none());
    }

    #[test]
    fn test_reads_overrides() {
        let config = config_from(&[
            ("PORT", "8081"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/wallet"),
            ("FULFILLMENT_URL", "http://certs.internal/issue"),
            ("FULFILLMENT_TIMEOUT_MS", "2500"),
            ("COMPENSATION_MAX_ATTEMPTS", "7"),
            ("COMPENSATION_INITIAL_BACKOFF_MS", "50"),
            ("STALE_PURCHASE_SECS", "120"),
            ("CATALOG_FILE", "/etc/wallet/catalog.json"),
        ]);

        assert_eq!(config.port, 8081);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/wallet")
        );
        assert_eq!(config.fulfillment_timeout, Duration::from_millis(2500));
        assert_eq!(config.compensation.max_attempts, 7);
        assert_eq!(config.compensation.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.stale_purchase_after, Duration::from_secs(120));
        assert_eq!(
            config.catalog_file,
            Some(PathBuf::from("/etc/wallet/catalog.json"))
        );

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.fulfillment_timeout, Duration::from_millis(2500));
        assert_eq!(orchestrator.retry.max_attempts, 7);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("COMPENSATION_MAX_ATTEMPTS", "0"),
            ("DATABASE_URL", "  "),
            ("LOG_FORMAT", "xml"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.compensation.max_attempts, 5);
        assert!(config.database_url.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_defaults_validate() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_stale_window_must_outlast_fulfillment_and_retries() {
        let config = config_from(&[
            ("FULFILLMENT_TIMEOUT_MS", "30000"),
            ("STALE_PURCHASE_SECS", "30"),
        ]);
        let in_flight = Duration::from_secs(30) + config.compensation.total_backoff();
        assert_eq!(
            config.validate(),
            Err(ConfigError::StaleWindowTooShort {
                stale_after: Duration::from_secs(30),
                in_flight,
            })
        );

        // Exceeding the timeout alone is not enough while retries may still sleep
        let config = config_from(&[
            ("FULFILLMENT_TIMEOUT_MS", "29500"),
            ("COMPENSATION_INITIAL_BACKOFF_MS", "1000"),
            ("STALE_PURCHASE_SECS", "30"),
        ]);
        assert!(config.validate().is_err());

        let config = config_from(&[
            ("FULFILLMENT_TIMEOUT_MS", "2500"),
            ("STALE_PURCHASE_SECS", "30"),
        ]);
        assert_eq!(config.validate(), Ok(()));
    }
}
