//! Command-line front-ends for the agent and the server.
//!
//! Configuration precedence, lowest first: defaults, YAML file, flags,
//! environment variables.

use crate::agent::{Agent, AllocStatsSource};
use crate::core::config::env_var;
use crate::core::{AgentConfig, Result, ServerConfig, ShutdownSignal, ShutdownTrigger, TallyError};
use crate::receiver::IngestServer;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime and host metrics agent
#[derive(Parser, Debug, Default)]
#[command(name = "tally-agent")]
#[command(version, about, long_about = None)]
pub struct AgentCli {
    /// Server HTTP address (host:port)
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Report interval in seconds
    #[arg(short = 'r', long)]
    pub report_interval: Option<u64>,

    /// Poll interval in seconds
    #[arg(short = 'p', long)]
    pub poll_interval: Option<u64>,

    /// HMAC key
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// Number of concurrent send workers
    #[arg(short = 'l', long)]
    pub rate_limit: Option<usize>,

    /// PEM file with the server's public key
    #[arg(long)]
    pub crypto_key: Option<PathBuf>,

    /// Server RPC address (host:port); reports go over RPC when set
    #[arg(short = 'g', long)]
    pub grpc_address: Option<String>,

    /// YAML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    pub debug: bool,
}

/// Metrics ingest server
#[derive(Parser, Debug, Default)]
#[command(name = "tally-server")]
#[command(version, about, long_about = None)]
pub struct ServerCli {
    /// HTTP listen address (host:port)
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// RPC listen address (host:port)
    #[arg(short = 'g', long)]
    pub grpc_address: Option<String>,

    /// Snapshot interval in seconds; 0 writes on every update
    #[arg(short = 'i', long)]
    pub store_interval: Option<u64>,

    /// Snapshot file
    #[arg(short = 'f', long)]
    pub file_storage_path: Option<PathBuf>,

    /// Restore the snapshot at startup
    #[arg(short = 'r', long)]
    pub restore: Option<bool>,

    /// SQLite database path
    #[arg(short = 'd', long)]
    pub database_dsn: Option<String>,

    /// HMAC key
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// PEM file with the private key
    #[arg(long)]
    pub crypto_key: Option<PathBuf>,

    /// Trusted agent subnet (CIDR)
    #[arg(short = 't', long)]
    pub trusted_subnet: Option<String>,

    /// YAML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    pub debug: bool,
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        TallyError::config(format!("Failed to read config file {}: {}", path.display(), e))
    })
}

fn config_path<F>(flag: Option<&PathBuf>, env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    env("CONFIG").map(PathBuf::from).or_else(|| flag.cloned())
}

impl AgentCli {
    /// Resolve the configuration from the process environment.
    pub fn load_config(&self) -> Result<AgentConfig> {
        self.load_config_with(env_var)
    }

    /// Resolve the configuration with a custom environment lookup.
    pub fn load_config_with<F>(&self, env: F) -> Result<AgentConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path(self.config.as_ref(), &env) {
            Some(path) => AgentConfig::from_yaml(&read_config_file(&path)?)?,
            None => AgentConfig::default(),
        };
        self.apply_flags(&mut config);
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_flags(&self, config: &mut AgentConfig) {
        if let Some(v) = &self.address {
            config.address.clone_from(v);
        }
        if let Some(v) = self.report_interval {
            config.report_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.poll_interval {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = &self.key {
            config.key = Some(v.clone());
        }
        if let Some(v) = self.rate_limit {
            config.rate_limit = v;
        }
        if let Some(v) = &self.crypto_key {
            config.crypto_key = Some(v.clone());
        }
        if let Some(v) = &self.grpc_address {
            config.grpc_address = Some(v.clone());
        }
    }
}

impl ServerCli {
    /// Resolve the configuration from the process environment.
    pub fn load_config(&self) -> Result<ServerConfig> {
        self.load_config_with(env_var)
    }

    /// Resolve the configuration with a custom environment lookup.
    pub fn load_config_with<F>(&self, env: F) -> Result<ServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path(self.config.as_ref(), &env) {
            Some(path) => ServerConfig::from_yaml(&read_config_file(&path)?)?,
            None => ServerConfig::default(),
        };
        self.apply_flags(&mut config);
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_flags(&self, config: &mut ServerConfig) {
        if let Some(v) = &self.address {
            config.address.clone_from(v);
        }
        if let Some(v) = &self.grpc_address {
            config.grpc_address = Some(v.clone());
        }
        if let Some(v) = self.store_interval {
            config.store_interval = Duration::from_secs(v);
        }
        if let Some(v) = &self.file_storage_path {
            config.file_storage_path.clone_from(v);
        }
        if let Some(v) = self.restore {
            config.restore = v;
        }
        if let Some(v) = &self.database_dsn {
            config.database_dsn = Some(v.clone());
        }
        if let Some(v) = &self.key {
            config.key = Some(v.clone());
        }
        if let Some(v) = &self.crypto_key {
            config.crypto_key = Some(v.clone());
        }
        if let Some(v) = &self.trusted_subnet {
            config.trusted_subnet = Some(v.clone());
        }
    }
}

/// Initialize logging.
///
/// `RUST_LOG` wins, then `TALLY_LOG_LEVEL`, then `info`; `debug` forces
/// the debug level.
pub fn init_logging(debug: bool) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_log_level = env_var("TALLY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_log_level))
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TallyError::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Fire `trigger` on Ctrl-C or SIGTERM.
pub fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                },
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                },
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::info!("Received interrupt, shutting down"),
                Err(e) => {
                    tracing::error!("Failed to listen for interrupt: {}", e);
                    return;
                },
            },
            () = terminate => tracing::info!("Received SIGTERM, shutting down"),
        }
        trigger.trigger();
    });
}

/// Run the agent until interrupted.
pub async fn run_agent(cli: AgentCli, alloc: &'static dyn AllocStatsSource) -> Result<()> {
    init_logging(cli.debug)?;
    let config = cli.load_config()?;
    tracing::info!(
        address = %config.address,
        poll = ?config.poll_interval,
        report = ?config.report_interval,
        rate_limit = config.rate_limit,
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        "Starting tally agent"
    );

    let (trigger, shutdown) = ShutdownSignal::new();
    spawn_signal_handler(trigger);
    Agent::new(&config, alloc)?.run(shutdown).await
}

/// Run the server until interrupted.
pub async fn run_server(cli: ServerCli) -> Result<()> {
    init_logging(cli.debug)?;
    let config = cli.load_config()?;
    tracing::info!(
        address = %config.address,
        grpc = ?config.grpc_address,
        database = config.database_dsn.is_some(),
        store_interval = ?config.store_interval,
        "Starting tally server"
    );

    let server = IngestServer::new(config).await?;
    let (trigger, shutdown) = ShutdownSignal::new();
    spawn_signal_handler(trigger);
    server.run(shutdown).await
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
    fn test_agent_flags_parse() {
        let cli = AgentCli::try_parse_from(["tally-agent", "-a", "10.0.0.1:9000", "-p", "1", "-l", "4"])
            .unwrap();
        assert_eq!(cli.address.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(cli.poll_interval, Some(1));
        assert_eq!(cli.rate_limit, Some(4));
    }

    #[test]
    fn test_env_overrides_flags() {
        let cli = AgentCli {
            address: Some("flag:1".to_string()),
            report_interval: Some(5),
            ..AgentCli::default()
        };
        let config = cli.load_config_with(env(&[("ADDRESS", "env:2")])).unwrap();
        assert_eq!(config.address, "env:2");
        assert_eq!(config.report_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_server_flags_then_env() {
        let cli = ServerCli::try_parse_from(["tally-server", "-i", "0", "-r", "false", "-t", "10.0.0.0/8"])
            .unwrap();
        let config = cli
            .load_config_with(env(&[("TRUSTED_SUBNET", "192.168.0.0/16")]))
            .unwrap();
        assert!(config.store_interval.is_zero());
        assert!(!config.restore);
        assert_eq!(config.trusted_subnet.as_deref(), Some("192.168.0.0/16"));
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let cli = ServerCli {
            config: Some(PathBuf::from("/nonexistent/tally.yaml")),
            ..ServerCli::default()
        };
        assert!(matches!(cli.load_config_with(env(&[])), Err(TallyError::Config(_))));
    }
}
