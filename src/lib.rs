pub mod config;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod supervisor;

// Make test_utils available for both unit tests and integration tests
pub mod test_utils;

use std::sync::Arc;

use config::GatewayConfig;
use mcp::{InstanceManager, PortPool, ToolPack, UpstreamProxy};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub manager: Arc<InstanceManager>,
    pub proxy: Arc<UpstreamProxy>,
}

impl AppState {
    /// Wires the registry, port pool and proxy from `config`
    pub fn new(config: GatewayConfig, tool_pack: Arc<dyn ToolPack>) -> Self {
        let ports = Arc::new(PortPool::new(config.pool_start, config.pool_size));
        let manager = InstanceManager::new(config.instance_settings(), ports, tool_pack);
        let proxy = Arc::new(UpstreamProxy::new(
            config.proxy_timeout,
            config.proxy_retry_timeout,
            config.max_body_bytes,
        ));

        Self {
            config: Arc::new(config),
            manager,
            proxy,
        }
    }
}
