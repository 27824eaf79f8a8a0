//! Dynamic per-tenant MCP instances and the gateway proxy
//!
//! This module materializes one isolated MCP sub-server per tenant on first
//! use, proxies traffic to it and evicts it after a period of inactivity.
//!
//! # Architecture
//!
//! - [`PortPool`] - Bounded allocator over the loopback ports sub-servers bind to
//! - [`McpInstance`] - One tenant's sub-server, port and TTL watchdog
//! - [`InstanceManager`] - Registry of live instances keyed by identifier
//! - [`TenantMcpService`] - MCP protocol handler each sub-server serves
//! - [`UpstreamProxy`] - Forwards gateway requests to a sub-server, streaming when needed
//! - [`proxy_mcp_root`] and [`proxy_mcp_path`] - HTTP handlers for `/{identifier}/mcp[/…]`
//!
//! # Example
//!
//! ```rust,no_run
//! use etendo_mcp_gateway::mcp::{InstanceManager, InstanceSettings, PortPool, ToolPack, ToolRegistrar};
//! use std::sync::Arc;
//!
//! struct NoTools;
//!
//! #[async_trait::async_trait]
//! impl ToolPack for NoTools {
//!     async fn register(&self, _registrar: &mut ToolRegistrar, _identifier: &str, _token: &str) {}
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = InstanceManager::new(
//!     InstanceSettings::default(),
//!     Arc::new(PortPool::new(5008, 1000)),
//!     Arc::new(NoTools),
//! );
//!
//! let instance = manager.get_or_create("tenantA", "Bearer abc").await?;
//! instance.touch();
//! manager.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod handlers;
pub mod http_transport;
pub mod instance;
pub mod port_pool;
pub mod registry;
pub mod service;

pub use handlers::{proxy_mcp_path, proxy_mcp_root};
pub use http_transport::UpstreamProxy;
pub use instance::{InstanceError, InstanceInfo, InstanceSettings, InstanceState, McpInstance, StopReason};
pub use port_pool::{PortPool, PortPoolError, PortPoolSnapshot};
pub use registry::{is_valid_identifier, InstanceManager};
pub use service::{TenantMcpService, ToolInvocation, ToolPack, ToolRegistrar};
