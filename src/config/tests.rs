//! Config module tests

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("VM_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${VM_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("VM_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("VM_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${VM_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("VM_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${VM_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("VM_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("VM_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${VM_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vibemesh.toml");

    std::env::set_var("VM_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("VM_TEST_BIND_PORT", "1885");

    let config_content = r#"
[server]
bind = "${VM_TEST_BIND_HOST}:${VM_TEST_BIND_PORT}"
max_connections = ${VM_TEST_MAX_CONN:-42}

[storage]
retention = "1h"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.server.max_connections, 42);
    assert_eq!(config.storage.retention, Duration::from_secs(3600));
    assert_eq!(config.survey.timeout, Duration::from_secs(2));

    std::env::remove_var("VM_TEST_BIND_HOST");
    std::env::remove_var("VM_TEST_BIND_PORT");
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = Config::load("/nonexistent/vibemesh.toml").unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.matching.strategy, MatchStrategy::Emitter);
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.server.max_connections, 100_000);
    assert_eq!(config.storage.provider, StorageProvider::Memory);
    assert_eq!(config.matching.strategy, MatchStrategy::Emitter);
    assert!(!config.cluster.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let license = License::generate().to_string();
    let toml = format!(
        r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:8080"
max_packet_size = 65536
outbound_buffer_size = 131072
connect_timeout = "5s"

[license]
license = "{license}"

[matching]
strategy = "mqtt"

[storage]
provider = "fjall"
path = "/var/lib/vibemesh"
retention = "7days"
gc_interval = "30s"

[presence]
queue_size = 10
flush_interval = "50ms"

[survey]
timeout = "500ms"

[cluster]
enabled = true
node_id = "node-1"
gossip_addr = "0.0.0.0:7946"
peer_addr = "0.0.0.0:7947"
seeds = ["10.0.0.2:7946"]
gossip_interval = "250ms"
full_sync_every = 10
"#
    );

    let config = Config::parse(&toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.matching.strategy, MatchStrategy::Mqtt);
    assert_eq!(config.storage.provider, StorageProvider::Fjall);
    assert_eq!(config.storage.retention, Duration::from_secs(7 * 24 * 3600));
    assert_eq!(config.presence.flush_interval, Duration::from_millis(50));
    assert_eq!(config.survey.timeout, Duration::from_millis(500));
    assert_eq!(config.cluster.node_id.as_deref(), Some("node-1"));
    assert_eq!(config.cluster.gossip_interval, Duration::from_millis(250));
    assert_eq!(config.cluster.full_sync_every, 10);
    assert_eq!(
        config.license.parse().unwrap().map(|l| l.contract()),
        license.parse::<License>().ok().map(|l| l.contract())
    );
}

#[test]
fn test_invalid_license_rejected() {
    let result = Config::parse(
        r#"
[license]
license = "not-a-license"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_log_level_rejected() {
    let result = Config::parse(
        r#"
[log]
level = "loud"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_outbound_buffer_must_hold_a_packet() {
    let result = Config::parse(
        r#"
[server]
max_packet_size = 1024
outbound_buffer_size = 512
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_cluster_addresses_must_differ() {
    let result = Config::parse(
        r#"
[cluster]
enabled = true
gossip_addr = "0.0.0.0:7946"
peer_addr = "0.0.0.0:7946"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_unknown_strategy_rejected() {
    let result = Config::parse(
        r#"
[matching]
strategy = "regex"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
