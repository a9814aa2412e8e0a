//! Configuration layering: defaults, YAML file, flags, environment.

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tally_lib::cli::{AgentCli, ServerCli};
use tally_lib::core::{AgentConfig, ServerConfig, TallyError};
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

fn write_yaml(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("tally.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_default_configs_are_valid() {
    let agent = AgentConfig::default();
    assert!(agent.validate().is_ok());
    assert_eq!(agent.poll_interval, Duration::from_secs(2));
    assert_eq!(agent.report_interval, Duration::from_secs(10));
    assert_eq!(agent.retry_attempts, 3);

    let server = ServerConfig::default();
    assert!(server.validate().is_ok());
    assert_eq!(server.store_interval, Duration::from_secs(300));
    assert!(server.restore);
}

#[test]
fn test_yaml_then_flags_then_env() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        "address: yaml:1\nreport_interval: 7s\npoll_interval: 3s\nrate_limit: 2\n",
    );
    let cli = AgentCli::try_parse_from([
        "tally-agent",
        "-c",
        path.to_str().unwrap(),
        "-p",
        "1",
        "-l",
        "5",
    ])
    .unwrap();

    let config = cli.load_config_with(env(&[("RATE_LIMIT", "8")])).unwrap();
    assert_eq!(config.address, "yaml:1");
    assert_eq!(config.report_interval, Duration::from_secs(7));
    assert_eq!(config.poll_interval, Duration::from_secs(1));
    assert_eq!(config.rate_limit, 8);
}

#[test]
fn test_config_path_from_env() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(&dir, "store_interval: 0s\nrestore: false\n");
    let config = ServerCli::default()
        .load_config_with(env(&[("CONFIG", path.to_str().unwrap())]))
        .unwrap();
    assert!(config.store_interval.is_zero());
    assert!(!config.restore);
}

#[test]
fn test_invalid_env_is_config_error() {
    let result = AgentCli::default().load_config_with(env(&[("POLL_INTERVAL", "soon")]));
    assert!(matches!(result, Err(TallyError::Config(_))));

    let result = ServerCli::default().load_config_with(env(&[("RESTORE", "maybe")]));
    assert!(matches!(result, Err(TallyError::Config(_))));
}

#[test]
fn test_zero_poll_interval_rejected() {
    let cli = AgentCli::try_parse_from(["tally-agent", "-p", "0"]).unwrap();
    assert!(matches!(cli.load_config_with(env(&[])), Err(TallyError::Config(_))));
}

#[test]
fn test_unparseable_yaml_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(&dir, "address: [unterminated\n");
    let cli = ServerCli {
        config: Some(path),
        ..ServerCli::default()
    };
    assert!(matches!(cli.load_config_with(env(&[])), Err(TallyError::Config(_))));
}

#[test]
fn test_server_flags() {
    let cli = ServerCli::try_parse_from([
        "tally-server",
        "-a",
        "0.0.0.0:9090",
        "-g",
        "0.0.0.0:3200",
        "-d",
        "/var/lib/tally/metrics.db",
        "-k",
        "s3cret",
        "--crypto-key",
        "/etc/tally/private.pem",
    ])
    .unwrap();
    let config = cli.load_config_with(env(&[])).unwrap();
    assert_eq!(config.address, "0.0.0.0:9090");
    assert_eq!(config.grpc_address.as_deref(), Some("0.0.0.0:3200"));
    assert_eq!(config.database_dsn.as_deref(), Some("/var/lib/tally/metrics.db"));
    assert_eq!(config.key.as_deref(), Some("s3cret"));
    assert_eq!(config.crypto_key, Some(PathBuf::from("/etc/tally/private.pem")));
}
