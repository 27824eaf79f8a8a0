use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "etendo-mcp-cli")]
#[command(about = "Inspect a running Etendo MCP gateway", long_about = None)]
struct Cli {
    /// Base URL of the gateway
    #[arg(long, env = "MCP_GATEWAY_URL", default_value = "http://localhost:5006")]
    url: String,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway liveness and port usage
    Status,

    /// List active MCP instances
    Instances,

    /// Version, TTL and port-pool summary
    Overview,
}

async fn fetch(client: &reqwest::Client, base: &str, path: &str) -> anyhow::Result<Value> {
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach gateway at {}", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("gateway answered {} for {}", status, url);
    }

    response
        .json()
        .await
        .with_context(|| format!("invalid JSON from {}", url))
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_status(health: &Value) {
    let stats = &health["port_stats"];
    println!("Status:           {}", text(&health["status"]));
    println!("Timestamp:        {}", text(&health["timestamp"]));
    println!("Active instances: {}", text(&health["active_instances"]));
    println!("Ports in use:     {}", text(&stats["used_ports"]));
    println!("Ports for reuse:  {}", text(&stats["available_ports"]));
    println!("Ports tracked:    {}", text(&stats["total_tracked"]));
}

fn print_instances(list: &Value) {
    let instances = match list["instances"].as_object() {
        Some(map) if !map.is_empty() => map,
        _ => {
            println!("No active instances.");
            return;
        }
    };

    println!(
        "{:<24} {:<9} {:<7} {:<10} {:<10} {:<10}",
        "Identifier", "Status", "Port", "Alive(s)", "Idle(min)", "TTL(min)"
    );
    println!("{}", "-".repeat(75));
    for (identifier, info) in instances {
        println!(
            "{:<24} {:<9} {:<7} {:<10} {:<10} {:<10}",
            identifier,
            text(&info["status"]),
            text(&info["port"]),
            text(&info["seconds_alive"]),
            text(&info["minutes_since_last_activity"]),
            text(&info["minutes_until_ttl"]),
        );
    }
}

fn print_overview(overview: &Value) {
    let ports = &overview["port_management"];
    println!("{} v{}", text(&overview["message"]), text(&overview["version"]));
    println!("{}", text(&overview["usage"]));
    println!("Active instances: {}", text(&overview["active_instances"]));
    println!("TTL:              {} min", text(&overview["ttl_minutes"]));
    println!(
        "Ports:            {} in use, {} for reuse, {} tracked",
        text(&ports["used_ports"]),
        text(&ports["available_for_reuse"]),
        text(&ports["total_ports_tracked"]),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let (path, printer): (&str, fn(&Value)) = match cli.command {
        Commands::Status => ("/health", print_status),
        Commands::Instances => ("/instances", print_instances),
        Commands::Overview => ("/", print_overview),
    };

    let body = fetch(&client, &cli.url, path).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        printer(&body);
    }

    Ok(())
}
