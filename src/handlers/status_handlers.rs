use crate::mcp::InstanceInfo;
use crate::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const GATEWAY_NAME: &str = "Etendo Copilot Dynamic MCP Server";
pub const GATEWAY_DESCRIPTION: &str = "Creates MCP instances on-demand based on identifier";

#[derive(Debug, Serialize)]
pub struct PortUsage {
    pub used_ports: usize,
    pub available_for_reuse: usize,
    pub total_ports_tracked: usize,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub message: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub active_instances: usize,
    pub ttl_minutes: f64,
    pub ttl_description: String,
    pub port_management: PortUsage,
}

#[derive(Debug, Serialize)]
pub struct PortStats {
    pub used_ports: Vec<u16>,
    pub available_ports: Vec<u16>,
    pub total_tracked: usize,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub active_instances: usize,
    pub port_stats: PortStats,
}

#[derive(Debug, Serialize)]
pub struct InstanceList {
    pub active_instances: usize,
    pub instances: BTreeMap<String, InstanceInfo>,
}

/// `GET /` - build info, TTL and port-pool counters
pub async fn overview_handler(State(state): State<AppState>) -> Json<Overview> {
    let ttl_minutes = state.config.ttl_minutes();
    let ports = state.manager.port_pool().snapshot();

    Json(Overview {
        message: GATEWAY_NAME,
        version: env!("CARGO_PKG_VERSION"),
        description: GATEWAY_DESCRIPTION,
        usage: "Access MCP instances at /{identifier}/mcp",
        active_instances: state.manager.len().await,
        ttl_minutes,
        ttl_description: format!(
            "Instances are automatically terminated after {} minutes of inactivity",
            ttl_minutes
        ),
        port_management: PortUsage {
            used_ports: ports.in_use.len(),
            available_for_reuse: ports.free_for_reuse.len(),
            total_ports_tracked: ports.total_tracked(),
        },
    })
}

/// `GET /health` - liveness plus the sorted port sets
pub async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    let ports = state.manager.port_pool().snapshot();
    let total_tracked = ports.total_tracked();

    Json(Health {
        status: "healthy",
        timestamp: Utc::now(),
        active_instances: state.manager.len().await,
        port_stats: PortStats {
            used_ports: ports.in_use,
            available_ports: ports.free_for_reuse,
            total_tracked,
        },
    })
}

/// `GET /instances`
pub async fn instances_handler(State(state): State<AppState>) -> Json<InstanceList> {
    let instances = state.manager.snapshot().await;

    Json(InstanceList {
        active_instances: instances.len(),
        instances,
    })
}
