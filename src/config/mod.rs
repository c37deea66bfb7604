use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::observability::LogFormat;
use crate::runs::{RetryPolicy, RunManagerConfig};

/// Eligibility engine configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "eligr")]
#[command(about = "Multi-tenant benefits eligibility decision engine")]
pub struct Config {
    /// HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "ELIGR_LISTEN_ADDR")]
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", env = "ELIGR_LOG_LEVEL")]
    pub log_level: String,

    /// Log line encoding
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "ELIGR_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Runs admitted but not finalized, per organization
    #[arg(long, default_value = "8", env = "ELIGR_MAX_CONCURRENT_RUNS_PER_ORG")]
    pub max_concurrent_runs_per_org: usize,

    /// Retries after the first attempt for run and audit writes
    #[arg(long, default_value = "3", env = "ELIGR_PERSISTENCE_MAX_RETRIES")]
    pub persistence_max_retries: u32,

    /// Base backoff in milliseconds, doubled on each retry
    #[arg(long, default_value = "25", env = "ELIGR_PERSISTENCE_BACKOFF_MS")]
    pub persistence_backoff_ms: u64,

    /// Page size for run and audit listings
    #[arg(long, default_value = "100", env = "ELIGR_PAGE_SIZE")]
    pub page_size: usize,

    /// How long a run submission waits for its decision before answering 202
    #[arg(long, default_value = "2000", env = "ELIGR_WAIT_TIMEOUT_MS")]
    pub wait_timeout_ms: u64,

    /// Directory of rule set YAML documents (optional, disables polling if not set)
    #[arg(long, env = "ELIGR_RULE_SET_DIR")]
    pub rule_set_dir: Option<PathBuf>,

    /// Rule set directory poll interval in seconds
    #[arg(long, default_value = "30", env = "ELIGR_RULE_SET_POLL_SECS")]
    pub rule_set_poll_secs: u64,

    /// Postgres connection string (optional, in-memory store if not set)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Minimum pooled database connections
    #[arg(long, default_value = "1", env = "ELIGR_DB_MIN_CONNECTIONS")]
    pub db_min_connections: u32,

    /// Maximum pooled database connections
    #[arg(long, default_value = "10", env = "ELIGR_DB_MAX_CONNECTIONS")]
    pub db_max_connections: u32,

    /// Upper bound on a single HTTP request in seconds
    #[arg(long, default_value = "30", env = "ELIGR_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent HTTP requests
    #[arg(long, default_value = "1024", env = "ELIGR_MAX_IN_FLIGHT_REQUESTS")]
    pub max_in_flight_requests: usize,

    /// Browser origins allowed by CORS, comma separated; empty allows any
    #[arg(long, env = "ELIGR_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Enable graceful shutdown
    #[arg(long, default_value = "true", env = "ELIGR_GRACEFUL_SHUTDOWN")]
    pub graceful_shutdown: bool,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30", env = "ELIGR_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Get rule set poll interval as Duration.
    pub fn rule_set_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rule_set_poll_secs)
    }

    /// Get shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn persistence_backoff(&self) -> Duration {
        Duration::from_millis(self.persistence_backoff_ms)
    }

    /// Settings injected into the run manager.
    pub fn run_manager_config(&self) -> RunManagerConfig {
        RunManagerConfig {
            max_concurrent_runs_per_org: self.max_concurrent_runs_per_org,
            retry: RetryPolicy::new(self.persistence_max_retries, self.persistence_backoff()),
            page_size: self.page_size.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            max_concurrent_runs_per_org: 8,
            persistence_max_retries: 3,
            persistence_backoff_ms: 25,
            page_size: 100,
            wait_timeout_ms: 2000,
            rule_set_dir: None,
            rule_set_poll_secs: 30,
            database_url: None,
            db_min_connections: 1,
            db_max_connections: 10,
            request_timeout_secs: 30,
            max_in_flight_requests: 1024,
            cors_origins: Vec::new(),
            graceful_shutdown: true,
            shutdown_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.max_concurrent_runs_per_org, 8);
        assert_eq!(config.page_size, 100);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_default_matches_cli_defaults() {
        let parsed = Config::try_parse_from(["eligr"]).unwrap();
        let default = Config::default();

        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.log_format, default.log_format);
        assert_eq!(parsed.persistence_max_retries, default.persistence_max_retries);
        assert_eq!(parsed.wait_timeout_ms, default.wait_timeout_ms);
        assert_eq!(parsed.rule_set_poll_secs, default.rule_set_poll_secs);
    }

    #[test]
    fn test_flags_override_defaults() {
        let parsed = Config::try_parse_from([
            "eligr",
            "--max-concurrent-runs-per-org",
            "2",
            "--log-format",
            "json",
            "--rule-set-dir",
            "/etc/eligr/rules",
        ])
        .unwrap();

        assert_eq!(parsed.max_concurrent_runs_per_org, 2);
        assert_eq!(parsed.log_format, LogFormat::Json);
        assert_eq!(parsed.rule_set_dir, Some(PathBuf::from("/etc/eligr/rules")));
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config {
            rule_set_poll_secs: 60,
            shutdown_timeout_secs: 15,
            wait_timeout_ms: 500,
            ..Default::default()
        };

        assert_eq!(config.rule_set_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(config.wait_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_run_manager_config() {
        let config = Config {
            max_concurrent_runs_per_org: 4,
            persistence_max_retries: 5,
            persistence_backoff_ms: 10,
            page_size: 0,
            ..Default::default()
        };

        let rm = config.run_manager_config();
        assert_eq!(rm.max_concurrent_runs_per_org, 4);
        assert_eq!(rm.retry.max_retries, 5);
        assert_eq!(rm.retry.base_delay, Duration::from_millis(10));
        assert_eq!(rm.page_size, 1);
    }
}
