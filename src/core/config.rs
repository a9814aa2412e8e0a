//! Configuration management for the agent and the server.
//!
//! Sources are layered, lowest priority first:
//! - Defaults
//! - YAML file
//! - Command-line flags (applied by `crate::cli`)
//! - Environment variables

use crate::core::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the server's HTTP endpoint
    pub address: String,
    /// `host:port` of the server's RPC endpoint; reports go over RPC when set
    pub grpc_address: Option<String>,
    /// Send cadence
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Collection cadence
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Shared HMAC secret
    pub key: Option<String>,
    /// Number of concurrent send workers
    pub rate_limit: usize,
    /// PEM file with the server's RSA public key
    pub crypto_key: Option<PathBuf>,
    /// Total attempts per request
    pub retry_attempts: u32,
    /// Time allowed for in-flight sends after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub address: String,
    /// RPC listen address; the RPC surface is disabled when unset
    pub grpc_address: Option<String>,
    /// Snapshot cadence; zero exports on every write
    #[serde(with = "humantime_serde")]
    pub store_interval: Duration,
    /// Snapshot file
    pub file_storage_path: PathBuf,
    /// Load the snapshot file at startup
    pub restore: bool,
    /// SQLite database path; the in-memory store is used when unset
    pub database_dsn: Option<String>,
    /// Shared HMAC secret
    pub key: Option<String>,
    /// PEM file with the RSA private key
    pub crypto_key: Option<PathBuf>,
    /// CIDR of trusted agents
    pub trusted_subnet: Option<String>,
    /// Connections opened eagerly by the SQLite pool
    pub db_pool_min: usize,
    /// Upper bound of concurrently leased SQLite connections
    pub db_pool_max: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            address: "localhost:8080".to_string(),
            grpc_address: None,
            report_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            key: None,
            rate_limit: 1,
            crypto_key: None,
            retry_attempts: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "localhost:8080".to_string(),
            grpc_address: None,
            store_interval: Duration::from_secs(300),
            file_storage_path: PathBuf::from("/tmp/metrics-db.json"),
            restore: true,
            database_dsn: None,
            key: None,
            crypto_key: None,
            trusted_subnet: None,
            db_pool_min: 1,
            db_pool_max: 8,
        }
    }
}

/// Looks up an environment variable, treating empty values as unset.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| TallyError::config(format!("{name} must be a number of seconds, got {raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|e| TallyError::config(format!("{name} must be true or false, got {raw:?}: {e}")))
}

fn parse_usize(name: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| TallyError::config(format!("{name} must be a non-negative integer, got {raw:?}: {e}")))
}

impl AgentConfig {
    /// Load configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ADDRESS") {
            self.address = v;
        }
        if let Some(v) = lookup("GRPC_ADDRESS") {
            self.grpc_address = Some(v);
        }
        if let Some(v) = lookup("REPORT_INTERVAL") {
            self.report_interval = parse_secs("REPORT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("POLL_INTERVAL") {
            self.poll_interval = parse_secs("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("KEY") {
            self.key = Some(v);
        }
        if let Some(v) = lookup("RATE_LIMIT") {
            self.rate_limit = parse_usize("RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(TallyError::config("server address must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(TallyError::config("poll interval must be greater than 0"));
        }
        if self.report_interval.is_zero() {
            return Err(TallyError::config("report interval must be greater than 0"));
        }
        if self.retry_attempts == 0 {
            return Err(TallyError::config("retry_attempts must be greater than 0"));
        }
        Ok(())
    }

    /// Base URL of the server's HTTP API
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address)
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ADDRESS") {
            self.address = v;
        }
        if let Some(v) = lookup("GRPC_ADDRESS") {
            self.grpc_address = Some(v);
        }
        if let Some(v) = lookup("STORE_INTERVAL") {
            self.store_interval = parse_secs("STORE_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("FILE_STORAGE_PATH") {
            self.file_storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RESTORE") {
            self.restore = parse_bool("RESTORE", &v)?;
        }
        if let Some(v) = lookup("DATABASE_DSN") {
            self.database_dsn = Some(v);
        }
        if let Some(v) = lookup("KEY") {
            self.key = Some(v);
        }
        if let Some(v) = lookup("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TRUSTED_SUBNET") {
            self.trusted_subnet = Some(v);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(TallyError::config("listen address must not be empty"));
        }
        if self.db_pool_max == 0 {
            return Err(TallyError::config("db_pool_max must be greater than 0"));
        }
        if self.db_pool_min > self.db_pool_max {
            return Err(TallyError::config(format!(
                "db_pool_min ({}) must not exceed db_pool_max ({})",
                self.db_pool_min, self.db_pool_max
            )));
        }
        if self.database_dsn.is_none() && self.file_storage_path.as_os_str().is_empty() {
            return Err(TallyError::config("file_storage_path must be set without a database"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_configs_are_valid() {
        assert!(AgentConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_agent_env_overlay() {
        let mut config = AgentConfig::default();
        config
            .apply_env(env(&[
                ("ADDRESS", "10.0.0.5:9000"),
                ("REPORT_INTERVAL", "7"),
                ("POLL_INTERVAL", "1"),
                ("RATE_LIMIT", "4"),
                ("KEY", "s3cret"),
            ]))
            .unwrap();

        assert_eq!(config.address, "10.0.0.5:9000");
        assert_eq!(config.report_interval, Duration::from_secs(7));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.key.as_deref(), Some("s3cret"));
        assert_eq!(config.base_url(), "http://10.0.0.5:9000");
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = AgentConfig::default();
        let err = config.apply_env(env(&[("POLL_INTERVAL", "soon")])).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));

        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[("RESTORE", "maybe")])).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = AgentConfig::default();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_bounds_validated() {
        let mut config = ServerConfig::default();
        config.db_pool_min = 10;
        config.db_pool_max = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_yaml_parsing() {
        let yaml = r#"
address: "0.0.0.0:9090"
store_interval: 0s
file_storage_path: /var/lib/tally/metrics.json
restore: false
trusted_subnet: 192.168.1.0/24
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.address, "0.0.0.0:9090");
        assert!(config.store_interval.is_zero());
        assert!(!config.restore);
        assert_eq!(config.trusted_subnet.as_deref(), Some("192.168.1.0/24"));
        assert_eq!(config.db_pool_max, 8);
    }
}
