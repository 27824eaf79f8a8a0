use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::instance::InstanceSettings;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5006;
pub const DEFAULT_POOL_START: u16 = 5008;
pub const DEFAULT_POOL_SIZE: u16 = 1000;
pub const DEFAULT_TTL_MINUTES: f64 = 10.0;
const MAX_TTL_MINUTES: f64 = 365.0 * 24.0 * 60.0;
pub const DEFAULT_ETENDO_HOST: &str = "http://host.docker.internal:8080/etendo";

/// Fraction of the TTL after which an idle instance is logged as a warning
pub const TTL_WARNING_RATIO: f64 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Port pool {start}..{end} exceeds the valid port range")]
    PoolOutOfRange { start: u16, end: u32 },

    #[error("Listener port {port} falls inside the instance port pool {start}..{end}")]
    ListenerInPool { port: u16, start: u16, end: u32 },
}

/// Gateway settings, read from the environment
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub pool_start: u16,
    pub pool_size: u16,
    pub instance_ttl: Duration,
    pub ttl_check_interval: Duration,
    pub proxy_timeout: Duration,
    pub proxy_retry_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_body_bytes: usize,
    pub etendo_host: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pool_start: DEFAULT_POOL_START,
            pool_size: DEFAULT_POOL_SIZE,
            instance_ttl: Duration::from_secs_f64(DEFAULT_TTL_MINUTES * 60.0),
            ttl_check_interval: Duration::from_secs(10),
            proxy_timeout: Duration::from_secs(30),
            proxy_retry_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(2000),
            max_body_bytes: 16 * 1024 * 1024,
            etendo_host: DEFAULT_ETENDO_HOST.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads the configuration from process environment variables
    ///
    /// Unset variables take their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let ttl_minutes: f64 = parse(&var, "MCP_INSTANCE_TTL_MINUTES", DEFAULT_TTL_MINUTES)?;
        if !(ttl_minutes > 0.0 && ttl_minutes <= MAX_TTL_MINUTES) {
            return Err(invalid(
                "MCP_INSTANCE_TTL_MINUTES",
                ttl_minutes,
                "must be positive and at most one year",
            ));
        }

        let check_secs: u64 = parse(&var, "MCP_TTL_CHECK_INTERVAL_SECS", 10)?;
        if check_secs == 0 {
            return Err(invalid("MCP_TTL_CHECK_INTERVAL_SECS", check_secs, "must be positive"));
        }

        let pool_size: u16 = parse(&var, "MCP_PORT_POOL_SIZE", DEFAULT_POOL_SIZE)?;
        if pool_size == 0 {
            return Err(invalid("MCP_PORT_POOL_SIZE", pool_size, "must be positive"));
        }

        let config = Self {
            host: var("COPILOT_HOST_MCP")
                .map(|host| host.trim().to_string())
                .unwrap_or(defaults.host),
            port: parse(&var, "COPILOT_PORT_MCP", DEFAULT_PORT)?,
            pool_start: parse(&var, "MCP_PORT_POOL_START", DEFAULT_POOL_START)?,
            pool_size,
            instance_ttl: Duration::from_secs_f64(ttl_minutes * 60.0),
            ttl_check_interval: Duration::from_secs(check_secs),
            proxy_timeout: Duration::from_secs(parse(&var, "MCP_PROXY_TIMEOUT_SECS", 30)?),
            proxy_retry_timeout: Duration::from_secs(parse(
                &var,
                "MCP_PROXY_RETRY_TIMEOUT_SECS",
                10,
            )?),
            shutdown_grace: Duration::from_millis(parse(&var, "MCP_SHUTDOWN_GRACE_MS", 2000)?),
            max_body_bytes: parse(&var, "MCP_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            etendo_host: var("ETENDO_HOST_DOCKER")
                .map(|host| host.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.etendo_host),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let end = self.pool_end();
        if end > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::PoolOutOfRange {
                start: self.pool_start,
                end,
            });
        }

        let port = u32::from(self.port);
        if port >= u32::from(self.pool_start) && port < end {
            return Err(ConfigError::ListenerInPool {
                port: self.port,
                start: self.pool_start,
                end,
            });
        }

        Ok(())
    }

    /// Exclusive end of the instance port pool
    pub fn pool_end(&self) -> u32 {
        u32::from(self.pool_start) + u32::from(self.pool_size)
    }

    /// `host:port` for the gateway listener; the host may be a name
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ttl_minutes(&self) -> f64 {
        self.instance_ttl.as_secs_f64() / 60.0
    }

    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            ttl: self.instance_ttl,
            check_interval: self.ttl_check_interval,
            warning_ratio: TTL_WARNING_RATIO,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

fn parse<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, raw.trim(), e)),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5006);
        assert_eq!(config.pool_start, 5008);
        assert_eq!(config.pool_size, 1000);
        assert_eq!(config.instance_ttl, Duration::from_secs(600));
        assert_eq!(config.ttl_check_interval, Duration::from_secs(10));
        assert_eq!(config.proxy_timeout, Duration::from_secs(30));
        assert_eq!(config.proxy_retry_timeout, Duration::from_secs(10));
        assert_eq!(config.etendo_host, DEFAULT_ETENDO_HOST);
    }

    #[test]
    fn test_fractional_ttl() {
        let config = GatewayConfig::from_lookup(lookup(&[("MCP_INSTANCE_TTL_MINUTES", "0.5")]))
            .expect("config");
        assert_eq!(config.instance_ttl, Duration::from_secs(30));
        assert_eq!(config.ttl_minutes(), 0.5);
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[("COPILOT_PORT_MCP", "  ")]))
            .expect("config");
        assert_eq!(config.port, 5006);
    }

    #[test]
    fn test_unparsable_value_is_error() {
        let err = GatewayConfig::from_lookup(lookup(&[("COPILOT_PORT_MCP", "abc")]))
            .expect_err("invalid port");
        assert!(matches!(err, ConfigError::Invalid { key: "COPILOT_PORT_MCP", .. }));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(GatewayConfig::from_lookup(lookup(&[("MCP_INSTANCE_TTL_MINUTES", "0")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("MCP_TTL_CHECK_INTERVAL_SECS", "0")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("MCP_PORT_POOL_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_pool_past_port_space_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("MCP_PORT_POOL_START", "65000"),
            ("MCP_PORT_POOL_SIZE", "1000"),
        ]))
        .expect_err("out of range");
        assert!(matches!(err, ConfigError::PoolOutOfRange { .. }));
    }

    #[test]
    fn test_listener_inside_pool_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[("COPILOT_PORT_MCP", "5010")]))
            .expect_err("overlap");
        assert!(matches!(err, ConfigError::ListenerInPool { port: 5010, .. }));
    }

    #[test]
    fn test_etendo_host_trailing_slash_trimmed() {
        let config = GatewayConfig::from_lookup(lookup(&[(
            "ETENDO_HOST_DOCKER",
            "http://etendo:8080/etendo/",
        )]))
        .expect("config");
        assert_eq!(config.etendo_host, "http://etendo:8080/etendo");
    }

    #[test]
    fn test_instance_settings_carry_timings() {
        let config = GatewayConfig::default();
        let settings = config.instance_settings();
        assert_eq!(settings.ttl, config.instance_ttl);
        assert_eq!(settings.warning_ratio, TTL_WARNING_RATIO);
    }

    #[test]
    fn test_listen_addr() {
        let config = GatewayConfig::from_lookup(lookup(&[("COPILOT_HOST_MCP", "localhost")]))
            .expect("config");
        assert_eq!(config.listen_addr(), "localhost:5006");
    }
}
