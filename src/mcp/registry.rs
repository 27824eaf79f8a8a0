//! Thread-safe MCP instance registry
//!
//! [`InstanceManager`] owns the identifier → [`McpInstance`] map and the
//! shared [`PortPool`]. All creation and destruction of instances goes
//! through it. The map lock is never held across an instance's start or
//! stop, so a slow start for one tenant never blocks another.

use crate::mcp::instance::{
    InstanceError, InstanceInfo, InstanceSettings, McpInstance, StopReason,
};
use crate::mcp::port_pool::PortPool;
use crate::mcp::service::ToolPack;
use crate::middleware::tenant_auth::{current_request_token, with_request_token};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier pattern is valid"));

/// Whether `identifier` is a legal tenant key: one or more of `[A-Za-z0-9_-]`
pub fn is_valid_identifier(identifier: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(identifier)
}

/// Registry of live MCP instances
///
/// # Examples
///
/// ```rust,no_run
/// use etendo_mcp_gateway::mcp::{InstanceManager, InstanceSettings, PortPool};
/// use etendo_mcp_gateway::services::CopilotToolPack;
/// # use etendo_mcp_gateway::services::EtendoClient;
/// use std::sync::Arc;
///
/// # async fn example(client: EtendoClient) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = InstanceManager::new(
///     InstanceSettings::default(),
///     Arc::new(PortPool::new(5008, 1000)),
///     Arc::new(CopilotToolPack::new(client)),
/// );
///
/// let instance = manager.get_or_create("tenantA", "Bearer abc").await?;
/// println!("tenantA served at {}", instance.url()?);
///
/// manager.cleanup().await;
/// # Ok(())
/// # }
/// ```
pub struct InstanceManager {
    settings: Arc<InstanceSettings>,
    ports: Arc<PortPool>,
    tool_pack: Arc<dyn ToolPack>,
    instances: RwLock<HashMap<String, Arc<McpInstance>>>,
}

impl InstanceManager {
    pub fn new(
        settings: InstanceSettings,
        ports: Arc<PortPool>,
        tool_pack: Arc<dyn ToolPack>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings: Arc::new(settings),
            ports,
            tool_pack,
            instances: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn port_pool(&self) -> &PortPool {
        &self.ports
    }

    /// Returns the running instance for `identifier`, creating or restarting it
    ///
    /// Concurrent calls for the same identifier share one instance and one
    /// port allocation. A stopped instance still in the registry is restarted
    /// and keeps its identity. The instance is touched before returning.
    ///
    /// # Errors
    ///
    /// * `InstanceError::InvalidIdentifier` - Identifier is not `[A-Za-z0-9_-]+`
    /// * `InstanceError::PortAllocation` / `InstanceError::Bind` - Start failed;
    ///   the entry has been removed from the registry
    pub async fn get_or_create(
        self: &Arc<Self>,
        identifier: &str,
        token: &str,
    ) -> Result<Arc<McpInstance>, InstanceError> {
        if !is_valid_identifier(identifier) {
            return Err(InstanceError::InvalidIdentifier(identifier.to_string()));
        }

        loop {
            let instance = self.entry(identifier, token).await;

            // Runs detached so a client disconnect cannot abandon a half-done start.
            // Task-locals do not cross spawn, so the request token is carried over.
            let activation = {
                let instance = Arc::clone(&instance);
                let request_token = current_request_token().unwrap_or_else(|| token.to_string());
                tokio::spawn(with_request_token(request_token, async move {
                    instance.activate().await
                }))
            };
            let outcome = activation
                .await
                .unwrap_or_else(|_| Err(InstanceError::StartAborted(identifier.to_string())));

            match outcome {
                Ok(()) => return Ok(instance),
                Err(InstanceError::Retired(_)) => {
                    // Lost a race with eviction; drop the stale entry and retry
                    self.remove_if_current(identifier, &instance).await;
                }
                Err(e) => {
                    self.remove_if_current(identifier, &instance).await;
                    tracing::error!(identifier, error = %e, "Failed to start MCP instance");
                    return Err(e);
                }
            }
        }
    }

    async fn entry(self: &Arc<Self>, identifier: &str, token: &str) -> Arc<McpInstance> {
        if let Some(instance) = self.instances.read().await.get(identifier) {
            return Arc::clone(instance);
        }

        let mut instances = self.instances.write().await;
        let instance = instances.entry(identifier.to_string()).or_insert_with(|| {
            tracing::info!(identifier, "Creating MCP instance");
            McpInstance::new(
                identifier.to_string(),
                token.to_string(),
                Arc::clone(&self.settings),
                Arc::clone(&self.ports),
                Arc::clone(&self.tool_pack),
                Arc::downgrade(self),
            )
        });
        Arc::clone(instance)
    }

    pub async fn get(&self, identifier: &str) -> Option<Arc<McpInstance>> {
        self.instances.read().await.get(identifier).map(Arc::clone)
    }

    /// Drops `identifier` from the registry without stopping it
    ///
    /// Unknown identifiers are ignored.
    pub async fn remove(&self, identifier: &str) -> Option<Arc<McpInstance>> {
        let removed = self.instances.write().await.remove(identifier);
        if removed.is_some() {
            tracing::debug!(identifier, "Removed MCP instance from registry");
        }
        removed
    }

    /// Drops `identifier` only while it still maps to `instance`
    pub(crate) async fn remove_if_current(&self, identifier: &str, instance: &Arc<McpInstance>) {
        let mut instances = self.instances.write().await;
        if instances
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            instances.remove(identifier);
            tracing::debug!(identifier, "Removed MCP instance from registry");
        }
    }

    /// Stops every instance, empties the registry and forgets all ports
    ///
    /// Per-instance failures are logged and skipped; cleanup always completes.
    pub async fn cleanup(&self) {
        let drained: Vec<(String, Arc<McpInstance>)> =
            self.instances.write().await.drain().collect();

        tracing::info!(count = drained.len(), "Stopping all MCP instances");

        for (identifier, instance) in drained {
            if let Err(e) = instance.retire(StopReason::Shutdown).await {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to stop MCP instance");
            }
        }

        self.ports.clear();
        tracing::info!("MCP instance cleanup complete");
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    pub async fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-instance status, keyed and sorted by identifier
    pub async fn snapshot(&self) -> BTreeMap<String, InstanceInfo> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(identifier, instance)| (identifier.clone(), instance.info()))
            .collect()
    }
}
