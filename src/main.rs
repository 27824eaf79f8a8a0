use etendo_mcp_gateway::{
    config::GatewayConfig,
    services::{CopilotToolPack, EtendoClient},
    supervisor, AppState,
};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etendo_mcp_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;

    tracing::info!(
        pool_start = config.pool_start,
        pool_end = config.pool_end(),
        ttl_minutes = config.ttl_minutes(),
        etendo_host = %config.etendo_host,
        "Starting Etendo MCP gateway"
    );

    let tool_pack = Arc::new(CopilotToolPack::new(EtendoClient::new(
        config.etendo_host.clone(),
    )));

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    let state = AppState::new(config, tool_pack);

    supervisor::serve(listener, state, supervisor::shutdown_signal()).await?;

    tracing::info!("Gateway stopped");
    Ok(())
}
