use etendo_mcp_gateway::config::{ConfigError, GatewayConfig};
use serial_test::serial;
use std::env;
use std::time::Duration;

const VARS: [&str; 11] = [
    "COPILOT_HOST_MCP",
    "COPILOT_PORT_MCP",
    "MCP_PORT_POOL_START",
    "MCP_PORT_POOL_SIZE",
    "MCP_INSTANCE_TTL_MINUTES",
    "MCP_TTL_CHECK_INTERVAL_SECS",
    "MCP_PROXY_TIMEOUT_SECS",
    "MCP_PROXY_RETRY_TIMEOUT_SECS",
    "MCP_SHUTDOWN_GRACE_MS",
    "MCP_MAX_BODY_BYTES",
    "ETENDO_HOST_DOCKER",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_env();

    let config = GatewayConfig::from_env().unwrap();

    assert_eq!(config.listen_addr(), "0.0.0.0:5006");
    assert_eq!(config.pool_start, 5008);
    assert_eq!(config.pool_end(), 6008);
    assert_eq!(config.ttl_minutes(), 10.0);
    assert_eq!(config.max_body_bytes, 16 * 1024 * 1024);
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_env();
    env::set_var("COPILOT_PORT_MCP", "7000");
    env::set_var("MCP_PORT_POOL_START", "9000");
    env::set_var("MCP_PORT_POOL_SIZE", "50");
    env::set_var("MCP_INSTANCE_TTL_MINUTES", "1.5");
    env::set_var("MCP_TTL_CHECK_INTERVAL_SECS", "3");
    env::set_var("MCP_SHUTDOWN_GRACE_MS", "500");

    let config = GatewayConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.port, 7000);
    assert_eq!(config.pool_start, 9000);
    assert_eq!(config.pool_end(), 9050);
    assert_eq!(config.instance_ttl, Duration::from_secs(90));

    let settings = config.instance_settings();
    assert_eq!(settings.check_interval, Duration::from_secs(3));
    assert_eq!(settings.shutdown_grace, Duration::from_millis(500));
}

#[test]
#[serial]
fn test_from_env_rejects_garbage() {
    clear_env();
    env::set_var("MCP_INSTANCE_TTL_MINUTES", "ten");

    let err = GatewayConfig::from_env().unwrap_err();
    clear_env();

    match err {
        ConfigError::Invalid { key, value, .. } => {
            assert_eq!(key, "MCP_INSTANCE_TTL_MINUTES");
            assert_eq!(value, "ten");
        }
        other => panic!("Expected Invalid, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_from_env_rejects_listener_in_pool() {
    clear_env();
    env::set_var("COPILOT_PORT_MCP", "5008");

    let err = GatewayConfig::from_env().unwrap_err();
    clear_env();

    assert!(matches!(err, ConfigError::ListenerInPool { port: 5008, .. }));
}
