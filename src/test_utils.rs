//! Shared fixtures for unit and integration tests

use crate::config::GatewayConfig;
use crate::mcp::service::{json_result, object_schema};
use crate::mcp::{McpInstance, ToolPack, ToolRegistrar};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const PORT_BASE: u32 = 15000;
const PROCESS_SLOT: u32 = 1024;
const PROCESS_SLOTS: u32 = 48;

static NEXT_OFFSET: AtomicU32 = AtomicU32::new(0);

/// A `(start, size)` port range not handed out before in this process
///
/// Each test binary draws from its own pid-derived slot so parallel test
/// processes rarely contend; the pool's bind probe skips anything taken.
pub fn free_port_range(size: u16) -> (u16, u16) {
    let slot = std::process::id() % PROCESS_SLOTS;
    let offset = NEXT_OFFSET.fetch_add(u32::from(size), Ordering::Relaxed) % PROCESS_SLOT;
    let start = PORT_BASE + slot * PROCESS_SLOT + offset;
    // Slots end well below 65535, so the cast cannot truncate
    (start as u16, size)
}

/// Tool pack with a single `ping` tool and no upstream dependency
pub struct StaticToolPack;

#[async_trait]
impl ToolPack for StaticToolPack {
    async fn register(&self, registrar: &mut ToolRegistrar, _identifier: &str, _token: &str) {
        registrar.add(
            "ping",
            "A simple ping tool to test MCP connectivity.",
            object_schema(&[]),
            |_| async { json_result(Value::String("pong".to_string())) },
        );
    }
}

/// Gateway configuration over a fresh port range with the given idle TTL
pub fn test_config(ttl: Duration) -> GatewayConfig {
    let (pool_start, pool_size) = free_port_range(16);
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        pool_start,
        pool_size,
        instance_ttl: ttl,
        ttl_check_interval: Duration::from_millis(50),
        proxy_timeout: Duration::from_secs(5),
        proxy_retry_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(200),
        ..GatewayConfig::default()
    }
}

/// Kills an instance's sub-server while leaving it marked `Running`
pub async fn crash_sub_server(instance: &McpInstance) {
    instance.kill_sub_server().await;
}
